//! `mpu-gc`: aborts multipart uploads that have sat open longer than
//! `max_age` without being completed or explicitly aborted.

use std::time::Duration;

use crate::engine::Engine;
use crate::error::Result;
use crate::ops::{now_iso, Report};

pub async fn run(engine: &Engine, max_age: Duration) -> Result<Report> {
    let started_at = now_iso();
    let cleaned = engine.gc_multipart_uploads(max_age).await?;
    let summary = serde_json::json!({ "uploads_aborted": cleaned });
    Ok(Report::new("mpu-gc", started_at, summary))
}
