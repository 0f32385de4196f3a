//! `fsck`: structural check. For every manifest on disk, confirms it
//! decodes and that each chunk ref's segment file is at least long
//! enough to hold the claimed bytes. Does not re-hash chunk payloads —
//! that is `scrub`'s job, since it is far more expensive.

use crate::engine::Engine;
use crate::error::Result;
use crate::ops::{now_iso, Report};

pub async fn run(engine: &Engine) -> Result<Report> {
    let started_at = now_iso();
    let manifests = engine.list_manifest_files().await?;
    let mut checked = 0u64;
    let mut corrupt_manifests = Vec::new();
    let mut short_segments = Vec::new();

    for (bucket, key, version_id) in &manifests {
        checked += 1;
        let bytes = match engine.manifest_bytes(bucket, key, version_id).await {
            Ok(b) => b,
            Err(e) => {
                corrupt_manifests.push(serde_json::json!({"bucket": bucket, "key": key, "version_id": version_id, "error": e.to_string()}));
                continue;
            }
        };
        let manifest = match crate::manifest::Manifest::decode(&bytes, bucket.clone(), key.clone()) {
            Ok(m) => m,
            Err(e) => {
                corrupt_manifests.push(serde_json::json!({"bucket": bucket, "key": key, "version_id": version_id, "error": e.to_string()}));
                continue;
            }
        };
        for chunk in &manifest.chunks {
            let path = engine.layout.segment_path(&chunk.segment_id);
            let ok = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len() >= (chunk.offset as u64 + chunk.len as u64),
                Err(_) => false,
            };
            if !ok {
                short_segments.push(serde_json::json!({
                    "bucket": bucket, "key": key, "version_id": version_id,
                    "segment_id": chunk.segment_id, "offset": chunk.offset, "len": chunk.len,
                }));
            }
        }
    }

    let summary = serde_json::json!({
        "manifests_checked": checked,
        "corrupt_manifests": corrupt_manifests,
        "short_segments": short_segments,
        "ok": corrupt_manifests.is_empty() && short_segments.is_empty(),
    });
    Ok(Report::new("fsck", started_at, summary))
}
