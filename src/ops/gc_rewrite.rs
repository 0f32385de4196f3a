//! `gc-rewrite-plan` / `gc-rewrite-run`: for segments whose live-byte
//! fraction has fallen below `live_threshold`, rewrites the still-live
//! chunks into fresh segments and repoints their manifests, so sparse
//! segments don't sit around forever just because `gc-run` requires a
//! segment to be *entirely* dead.

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::Result;
use crate::manifest::{ChunkRef, Manifest};
use crate::ops::{now_iso, Report};

struct SegmentUsage {
    total_bytes: u64,
    live_bytes: u64,
}

async fn compute_usage(engine: &Engine) -> Result<HashMap<String, SegmentUsage>> {
    let mut usage: HashMap<String, SegmentUsage> = HashMap::new();
    let mut entries = tokio::fs::read_dir(engine.layout.segments_dir()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let segment_id = entry.file_name().to_string_lossy().to_string();
        let size = entry.metadata().await?.len();
        usage.insert(segment_id, SegmentUsage { total_bytes: size, live_bytes: 0 });
    }
    for (bucket, key, version_id) in engine.list_manifest_files().await? {
        if let Ok(bytes) = engine.manifest_bytes(&bucket, &key, &version_id).await {
            if let Ok(manifest) = Manifest::decode(&bytes, bucket, key) {
                for chunk in manifest.chunks {
                    if let Some(entry) = usage.get_mut(&chunk.segment_id) {
                        entry.live_bytes += chunk.len as u64;
                    }
                }
            }
        }
    }
    Ok(usage)
}

fn sparse_segments(usage: &HashMap<String, SegmentUsage>, live_threshold: f64) -> Vec<String> {
    usage
        .iter()
        .filter(|(_, u)| u.total_bytes > 0 && (u.live_bytes as f64 / u.total_bytes as f64) < live_threshold)
        .map(|(id, _)| id.clone())
        .collect()
}

pub async fn plan(engine: &Engine, live_threshold: f64) -> Result<Report> {
    let started_at = now_iso();
    let usage = compute_usage(engine).await?;
    let sparse = sparse_segments(&usage, live_threshold);
    let rewritable_bytes: u64 = sparse.iter().filter_map(|id| usage.get(id)).map(|u| u.live_bytes).sum();
    let summary = serde_json::json!({
        "sparse_segments": sparse,
        "rewritable_bytes": rewritable_bytes,
        "rewritten_bytes": 0,
    });
    Ok(Report::new("gc-rewrite-plan", started_at, summary))
}

/// Rewrites every sparse segment's live chunks into fresh segments via
/// the engine's own `write_chunk_at`/append path, then updates every
/// affected manifest in place. Each manifest rewrite is independent, so
/// a crash mid-run simply leaves some manifests still pointing at the
/// old (still-intact, not yet deleted) segment.
pub async fn run(engine: &Engine, live_threshold: f64) -> Result<Report> {
    let started_at = now_iso();
    let usage = compute_usage(engine).await?;
    let sparse = sparse_segments(&usage, live_threshold);
    let mut rewritten_bytes = 0u64;
    let mut rewritten_manifests = 0u64;

    for (bucket, key, version_id) in engine.list_manifest_files().await? {
        let bytes = match engine.manifest_bytes(&bucket, &key, &version_id).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        let manifest = match Manifest::decode(&bytes, bucket.clone(), key.clone()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !manifest.chunks.iter().any(|c| sparse.contains(&c.segment_id)) {
            continue;
        }

        let mut new_chunks = Vec::with_capacity(manifest.chunks.len());
        for chunk in &manifest.chunks {
            if !sparse.contains(&chunk.segment_id) {
                new_chunks.push(chunk.clone());
                continue;
            }
            let data = read_live_chunk(engine, chunk).await?;
            let append = engine.segment_manager().append_chunk(&chunk.hash, &data).await?;
            rewritten_bytes += data.len() as u64;
            new_chunks.push(ChunkRef {
                index: chunk.index,
                hash: chunk.hash,
                segment_id: append.segment_id,
                offset: append.offset,
                len: chunk.len,
            });
        }
        let rewritten = Manifest::from_chunks(bucket.clone(), key.clone(), version_id.clone(), new_chunks);
        engine.store_manifest_bytes(&bucket, &key, &version_id, &rewritten.encode()).await?;
        rewritten_manifests += 1;
    }

    let summary = serde_json::json!({
        "sparse_segments": sparse,
        "rewritten_bytes": rewritten_bytes,
        "rewritten_manifests": rewritten_manifests,
    });
    Ok(Report::new("gc-rewrite-run", started_at, summary))
}

async fn read_live_chunk(engine: &Engine, chunk: &ChunkRef) -> Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let path = engine.layout.segment_path(&chunk.segment_id);
    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(std::io::SeekFrom::Start(chunk.offset as u64)).await?;
    let mut buf = vec![0u8; chunk.len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
