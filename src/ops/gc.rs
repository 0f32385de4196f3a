//! `gc-plan` / `gc-run`: reclaims whole segment files that no live
//! manifest references any longer. A segment is eligible once every
//! chunk it ever held has fallen out of every manifest's chunk list and
//! it has sat sealed for at least `min_age`.

use std::collections::HashSet;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::Result;
use crate::ops::{now_iso, Report};

async fn referenced_segment_ids(engine: &Engine) -> Result<HashSet<String>> {
    let mut referenced = HashSet::new();
    for (bucket, key, version_id) in engine.list_manifest_files().await? {
        if let Ok(bytes) = engine.manifest_bytes(&bucket, &key, &version_id).await {
            if let Ok(manifest) = crate::manifest::Manifest::decode(&bytes, bucket, key) {
                for chunk in manifest.chunks {
                    referenced.insert(chunk.segment_id);
                }
            }
        }
    }
    Ok(referenced)
}

async fn eligible_segments(engine: &Engine, min_age: Duration) -> Result<Vec<(String, i64)>> {
    let referenced = referenced_segment_ids(engine).await?;
    let mut eligible = Vec::new();
    let now = std::time::SystemTime::now();
    let mut entries = tokio::fs::read_dir(engine.layout.segments_dir()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let segment_id = entry.file_name().to_string_lossy().to_string();
        if referenced.contains(&segment_id) {
            continue;
        }
        let meta = entry.metadata().await?;
        let age = now.duration_since(meta.modified().unwrap_or(now)).unwrap_or_default();
        if age < min_age {
            continue;
        }
        if let Some(row) = engine.metadata().get_segment(&segment_id).await? {
            if row.state != "SEALED" {
                continue;
            }
        }
        eligible.push((segment_id, meta.len() as i64));
    }
    Ok(eligible)
}

pub async fn plan(engine: &Engine, min_age: Duration) -> Result<Report> {
    let started_at = now_iso();
    let eligible = eligible_segments(engine, min_age).await?;
    let reclaim_bytes: i64 = eligible.iter().map(|(_, size)| size).sum();
    let summary = serde_json::json!({
        "segments": eligible.iter().map(|(id, size)| serde_json::json!({"segment_id": id, "size": size})).collect::<Vec<_>>(),
        "reclaimed_bytes": 0,
        "planned_reclaim_bytes": reclaim_bytes,
    });
    Ok(Report::new("gc-plan", started_at, summary))
}

pub async fn run(engine: &Engine, min_age: Duration) -> Result<Report> {
    let started_at = now_iso();
    let eligible = eligible_segments(engine, min_age).await?;
    let mut reclaimed_bytes = 0i64;
    let mut removed = Vec::new();
    for (segment_id, size) in eligible {
        let path = engine.layout.segment_path(&segment_id);
        if tokio::fs::remove_file(&path).await.is_ok() {
            reclaimed_bytes += size;
            removed.push(segment_id);
        }
    }
    let summary = serde_json::json!({
        "removed_segments": removed,
        "reclaimed_bytes": reclaimed_bytes,
    });
    Ok(Report::new("gc-run", started_at, summary))
}
