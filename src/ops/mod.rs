//! Offline/online maintenance jobs: fsck, scrub, snapshot, rebuild-index,
//! the two GC families, multipart GC, replication validation, and the
//! support bundle. Each mode produces a `Report` that the caller records
//! via `MetadataStore::record_ops_run`.

pub mod fsck;
pub mod gc;
pub mod gc_rewrite;
pub mod mpu_gc;
pub mod rebuild;
pub mod repl_validate;
pub mod scrub;
pub mod snapshot;
pub mod status;
pub mod support_bundle;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::Engine;
use crate::error::Result;

/// Uniform result shape for every ops mode: a mode name, a free-form
/// JSON summary (the shape varies by mode), and start/finish timestamps
/// so `ListGCTrends` can derive rates from history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub mode: String,
    pub started_at: String,
    pub finished_at: String,
    pub summary: serde_json::Value,
}

impl Report {
    pub fn new(mode: &str, started_at: String, summary: serde_json::Value) -> Self {
        Self {
            mode: mode.to_string(),
            started_at,
            finished_at: now_iso(),
            summary,
        }
    }
}

pub fn now_iso() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    crate::metadata::httpdate_from_secs(secs)
}

/// Run one ops mode's report through to persistence.
pub async fn record(engine: &Engine, report: &Report) -> Result<()> {
    engine
        .metadata()
        .record_ops_run(&report.mode, &report.started_at, &report.finished_at, &report.summary.to_string())
        .await
}
