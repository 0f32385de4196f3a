//! Group-commit write barrier: amortizes fsync and SQL-commit cost
//! across concurrent writers while preserving the durability of every
//! acknowledged write.
//!
//! Contract: once `wait()` returns `Ok(())`, every commit closure
//! registered before that call has run inside one SQL transaction that
//! has committed, and the active segment has been fsynced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use crate::error::{Result, SeglakeError};
use crate::segment::SegmentManager;

/// One pending write's commit logic, run inside the shared SQL
/// transaction. Boxed so the barrier can batch closures from unrelated
/// callers without knowing their concrete type.
pub type CommitClosure = Box<dyn for<'a> FnOnce(&rusqlite::Transaction<'a>) -> Result<()> + Send>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes a batch of commit closures inside one SQL transaction.
/// Implemented by the metadata store; kept as a trait so the barrier
/// doesn't need to know about connection pooling or schema.
pub trait MetaFlusher: Send + Sync {
    fn flush_commits<'a>(&'a self, commits: Vec<CommitClosure>) -> BoxFuture<'a, Result<()>>;
}

/// Result delivered to every waiter satisfied by one flush. `Arc`-wrapped
/// because one flush's outcome fans out to many waiters, and
/// `SeglakeError` itself need not be `Clone`.
pub type BarrierResult = std::result::Result<(), Arc<SeglakeError>>;

struct BarrierState {
    pending_bytes: u64,
    waiters: Vec<oneshot::Sender<BarrierResult>>,
    commits: Vec<CommitClosure>,
    flush_running: bool,
    timer_generation: u64,
    timer_armed: bool,
}

pub struct WriteBarrier {
    interval: Duration,
    max_bytes: u64,
    state: Mutex<BarrierState>,
    segments: Arc<SegmentManager>,
    meta: Arc<dyn MetaFlusher>,
}

impl WriteBarrier {
    pub fn new(
        interval: Duration,
        max_bytes: u64,
        segments: Arc<SegmentManager>,
        meta: Arc<dyn MetaFlusher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interval,
            max_bytes,
            state: Mutex::new(BarrierState {
                pending_bytes: 0,
                waiters: Vec::new(),
                commits: Vec::new(),
                flush_running: false,
                timer_generation: 0,
                timer_armed: false,
            }),
            segments,
            meta,
        })
    }

    /// Queue a commit closure for the next flush.
    pub async fn register(&self, commit: CommitClosure) {
        let mut state = self.state.lock().await;
        state.commits.push(commit);
    }

    /// Account for `n` bytes written to the active segment since the
    /// last flush. If the threshold is crossed and a waiter is already
    /// queued, a flush is kicked off without waiting for the timer.
    pub async fn add_bytes(self: &Arc<Self>, n: u64) {
        let should_kick = {
            let mut state = self.state.lock().await;
            state.pending_bytes += n;
            state.pending_bytes >= self.max_bytes && !state.waiters.is_empty() && !state.flush_running
        };
        if should_kick {
            self.spawn_flush();
        }
    }

    /// Block until a flush satisfies this caller's previously-registered
    /// commits. Never drops a caller's commit on the floor: if the
    /// barrier's own task is dropped, the oneshot receiver errors out,
    /// which this maps to a fatal error rather than silently succeeding.
    pub async fn wait(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let should_kick_now;
        let should_arm_timer;
        {
            let mut state = self.state.lock().await;
            state.waiters.push(tx);
            should_kick_now = state.pending_bytes >= self.max_bytes && !state.flush_running;
            should_arm_timer = !should_kick_now && !state.timer_armed;
            if should_arm_timer {
                state.timer_armed = true;
            }
        }
        if should_kick_now {
            self.spawn_flush();
        } else if should_arm_timer {
            self.spawn_timer();
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SeglakeError::fatal(e.to_string())),
            Err(_) => Err(SeglakeError::fatal("write barrier dropped before flush")),
        }
    }

    fn spawn_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.flush().await });
    }

    fn spawn_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let generation_at_arm = {
                let state = this.state.lock().await;
                state.timer_generation
            };
            this.fire_timer(generation_at_arm).await;
        });
    }

    async fn fire_timer(self: &Arc<Self>, generation_at_arm: u64) {
        let should_flush = {
            let mut state = self.state.lock().await;
            if state.timer_generation != generation_at_arm || !state.timer_armed {
                false
            } else {
                state.timer_armed = false;
                true
            }
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Drain all pending commits and waiters, run the commits in one SQL
    /// transaction via `MetaFlusher`, seal the active segment if it has
    /// idled out, then deliver the result to every waiter.
    async fn flush(self: &Arc<Self>) {
        let (commits, waiters) = {
            let mut state = self.state.lock().await;
            if state.flush_running {
                return;
            }
            state.flush_running = true;
            state.timer_generation += 1;
            state.timer_armed = false;
            state.pending_bytes = 0;
            (
                std::mem::take(&mut state.commits),
                std::mem::take(&mut state.waiters),
            )
        };

        let result = self.meta.flush_commits(commits).await;
        if result.is_ok() {
            if let Err(e) = self.segments.seal_if_idle().await {
                tracing::warn!(error = %e, "seal_if_idle failed after barrier flush");
            }
        }

        let fanout: BarrierResult = result.map_err(Arc::new);
        for waiter in waiters {
            let _ = waiter.send(fanout.clone());
        }

        let mut state = self.state.lock().await;
        state.flush_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingFlusher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MetaFlusher for CountingFlusher {
        fn flush_commits<'a>(&'a self, commits: Vec<CommitClosure>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    return Err(SeglakeError::fatal("boom"));
                }
                let mut conn = rusqlite::Connection::open_in_memory().unwrap();
                let tx = conn.transaction().unwrap();
                for c in commits {
                    c(&tx)?;
                }
                tx.commit().unwrap();
                Ok(())
            })
        }
    }

    fn make_barrier(max_bytes: u64, interval: Duration, fail: bool) -> (Arc<WriteBarrier>, Arc<CountingFlusher>) {
        let dir = tempdir().unwrap();
        let segments = Arc::new(SegmentManager::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_secs(600),
        ));
        let flusher = Arc::new(CountingFlusher {
            calls: AtomicUsize::new(0),
            fail,
        });
        let barrier = WriteBarrier::new(interval, max_bytes, segments, flusher.clone());
        (barrier, flusher)
    }

    #[tokio::test]
    async fn wait_returns_ok_after_byte_threshold_flush() {
        let (barrier, flusher) = make_barrier(10, Duration::from_secs(600), false);
        barrier.register(Box::new(|_tx| Ok(()))).await;
        barrier.add_bytes(5).await;
        let wait_fut = barrier.wait();
        barrier.add_bytes(10).await;
        wait_fut.await.unwrap();
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_returns_ok_after_timer_flush() {
        let (barrier, flusher) = make_barrier(u64::MAX, Duration::from_millis(20), false);
        barrier.register(Box::new(|_tx| Ok(()))).await;
        barrier.wait().await.unwrap();
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_concurrent_waiters_see_the_same_flush_error() {
        let (barrier, _flusher) = make_barrier(1, Duration::from_secs(600), true);
        barrier.register(Box::new(|_tx| Ok(()))).await;
        let b2 = barrier.clone();
        let w1 = tokio::spawn(async move { b2.wait().await });
        barrier.add_bytes(1).await;
        let r1 = w1.await.unwrap();
        assert!(r1.is_err());
    }

    #[tokio::test]
    async fn register_without_wait_is_picked_up_by_a_later_flush() {
        let (barrier, flusher) = make_barrier(1, Duration::from_secs(600), false);
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        barrier
            .register(Box::new(move |_tx| {
                hit2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        barrier.add_bytes(1).await; // threshold met but no waiters yet: no auto-kick
        barrier.wait().await.unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
    }
}
