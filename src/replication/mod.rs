//! Multi-site replication over HTTP: each site keeps its own HLC and
//! oplog; peers exchange oplog entries and back-fill the chunk data any
//! newly-learned manifest references. Last-writer-wins by HLC, ties
//! broken by `site_id`, is enforced entirely in `metadata::mod` —
//! this module only moves bytes.

pub mod bootstrap;
pub mod pull;
pub mod push;
pub mod wire;

use std::time::Duration;

pub use wire::{OplogPullResponse, OplogPushRequest, OplogPushResponse, SnapshotMeta};

/// One configured peer this site replicates with.
#[derive(Clone, Debug)]
pub struct RemotePeer {
    pub base_url: String,
}

/// Retry policy for chunk back-fill during a pull: exponential backoff
/// starting at `initial_delay`, doubling each attempt, capped at
/// `max_attempts`, bounded overall by `deadline`.
#[derive(Clone, Copy, Debug)]
pub struct BackfillRetryPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
}

impl Default for BackfillRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_attempts: 3,
            deadline: Duration::from_secs(5 * 60),
        }
    }
}
