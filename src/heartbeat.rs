//! Single-writer-per-data-dir enforcement via a lock file written every
//! `interval` and considered stale after `stale_after`. Acquisition uses
//! `O_CREATE|O_EXCL` so two processes racing to open the same data
//! directory can't both believe they hold it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, SeglakeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockContents {
    pub pid: u32,
    pub site_id: String,
    pub written_at_unix: u64,
}

impl LockContents {
    fn encode(&self) -> String {
        format!("{}\n{}\n{}\n", self.pid, self.site_id, self.written_at_unix)
    }

    fn parse(s: &str) -> Option<Self> {
        let mut lines = s.lines();
        let pid = lines.next()?.parse().ok()?;
        let site_id = lines.next()?.to_string();
        let written_at_unix = lines.next()?.parse().ok()?;
        Some(Self {
            pid,
            site_id,
            written_at_unix,
        })
    }
}

pub struct Heartbeat {
    path: PathBuf,
    site_id: String,
    stale_after: Duration,
}

impl Heartbeat {
    pub fn new(path: PathBuf, site_id: String, stale_after: Duration) -> Self {
        Self {
            path,
            site_id,
            stale_after,
        }
    }

    /// Acquires the lock if absent or stale. Fails with `Concurrency` if
    /// a fresh lock from another process already exists.
    pub fn acquire(&self) -> Result<()> {
        if let Some(existing) = read_lock(&self.path)? {
            if !is_stale(&existing, self.stale_after) {
                return Err(SeglakeError::concurrency(format!(
                    "data directory locked by pid {} (site {})",
                    existing.pid, existing.site_id
                )));
            }
            std::fs::remove_file(&self.path)?;
        }
        self.write_once(true)
    }

    /// Re-stamp the lock with the current time. Called on the heartbeat
    /// interval by a background task.
    pub fn refresh(&self) -> Result<()> {
        self.write_once(false)
    }

    fn write_once(&self, exclusive: bool) -> Result<()> {
        let contents = LockContents {
            pid: std::process::id(),
            site_id: self.site_id.clone(),
            written_at_unix: now_unix(),
        };
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true);
        if exclusive {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        let mut file = opts.open(&self.path).map_err(|e| {
            if exclusive && e.kind() == std::io::ErrorKind::AlreadyExists {
                SeglakeError::concurrency("lock file appeared concurrently during acquire")
            } else {
                SeglakeError::Io(e)
            }
        })?;
        file.write_all(contents.encode().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn read_lock(path: &Path) -> Result<Option<LockContents>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(LockContents::parse(&s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_stale(lock: &LockContents, stale_after: Duration) -> bool {
    now_unix().saturating_sub(lock.written_at_unix) > stale_after.as_secs()
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
