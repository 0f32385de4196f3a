//! `status`: a point-in-time read of bucket/object/segment counts and
//! the maintenance state machine, with no side effects.

use crate::engine::Engine;
use crate::error::Result;
use crate::ops::{now_iso, Report};

pub async fn run(engine: &Engine) -> Result<Report> {
    let started_at = now_iso();
    let buckets = engine.metadata().list_buckets().await?;
    let open_segments = engine.metadata().list_open_segments().await?;
    let maintenance_state = engine.metadata().maintenance_state().await?;
    let current_hlc = engine.metadata().current_hlc().await?;

    let mut bucket_object_counts = serde_json::Map::new();
    for bucket in &buckets {
        let mut total = 0i64;
        let mut after = String::new();
        loop {
            let page = engine.list_objects(&bucket.bucket, "", &after, 1000).await?;
            if page.is_empty() {
                break;
            }
            total += page.len() as i64;
            after = page.last().unwrap().0.clone();
            if page.len() < 1000 {
                break;
            }
        }
        bucket_object_counts.insert(bucket.bucket.clone(), serde_json::json!(total));
    }

    let summary = serde_json::json!({
        "bucket_count": buckets.len(),
        "objects_per_bucket": bucket_object_counts,
        "open_segment_count": open_segments.len(),
        "maintenance_state": maintenance_state,
        "current_hlc": current_hlc.format(),
    });

    Ok(Report::new("status", started_at, summary))
}
