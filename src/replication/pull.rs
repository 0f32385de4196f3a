//! Pull loop: fetch new oplog entries from a peer, apply them locally,
//! then back-fill any chunk data the newly-learned manifests reference
//! but this site doesn't have yet.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::engine::Engine;
use crate::error::{Result, SeglakeError};
use crate::manifest::Manifest;
use crate::replication::wire::{ChunkFetchResponse, ManifestFetchResponse, OplogPullResponse};
use crate::replication::{BackfillRetryPolicy, RemotePeer};

pub struct PullOutcome {
    pub applied: u32,
    pub chunks_backfilled: u64,
    pub chunks_failed: u64,
}

pub async fn pull_once(engine: &Engine, client: &reqwest::Client, peer: &RemotePeer, policy: BackfillRetryPolicy) -> Result<PullOutcome> {
    let (_, since) = engine.metadata().get_remote_watermarks(&peer.base_url).await?;
    let since = since.unwrap_or(crate::clock::Hlc::MIN);

    let url = format!("{}/v1/replication/oplog?since={}", peer.base_url, since.format());
    let response: OplogPullResponse = client
        .get(&url)
        .timeout(engine.config.replication_request_timeout)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let entry_count = response.entries.len();
    let puts: Vec<_> = response
        .entries
        .iter()
        .filter(|e| e.op_type == crate::metadata::OpType::Put)
        .cloned()
        .collect();
    let applied = engine.metadata().apply_oplog_entries(response.entries).await?;

    if let Some(next_since) = crate::clock::Hlc::parse(&response.next_since) {
        engine.metadata().set_remote_pull_watermark(&peer.base_url, &next_since).await?;
    }

    let mut chunks_backfilled = 0u64;
    let mut chunks_failed = 0u64;
    for put in &puts {
        let Some(version_id) = &put.version_id else { continue };
        if engine.manifest_bytes(&put.bucket, &put.key, version_id).await.is_ok() {
            continue;
        }
        let manifest = match fetch_manifest(client, peer, engine, &put.bucket, &put.key, version_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, bucket = %put.bucket, key = %put.key, "replication: manifest fetch failed");
                continue;
            }
        };
        for chunk in engine.missing_chunks(&manifest).await? {
            match backfill_chunk(engine, client, peer, &chunk, policy).await {
                Ok(()) => chunks_backfilled += 1,
                Err(e) => {
                    chunks_failed += 1;
                    tracing::warn!(error = %e, segment_id = %chunk.segment_id, "replication: chunk backfill failed after retries");
                }
            }
        }
    }

    tracing::info!(peer = %peer.base_url, entries = entry_count, applied, chunks_backfilled, chunks_failed, "replication pull complete");
    Ok(PullOutcome {
        applied,
        chunks_backfilled,
        chunks_failed,
    })
}

async fn fetch_manifest(
    client: &reqwest::Client,
    peer: &RemotePeer,
    engine: &Engine,
    bucket: &str,
    key: &str,
    version_id: &str,
) -> Result<Manifest> {
    let url = format!(
        "{}/v1/replication/manifest?bucket={}&key={}&version_id={}",
        peer.base_url,
        urlencoding_encode(bucket),
        urlencoding_encode(key),
        urlencoding_encode(version_id)
    );
    let resp: ManifestFetchResponse = client.get(&url).send().await?.error_for_status()?.json().await?;
    let bytes = BASE64
        .decode(resp.manifest_b64)
        .map_err(|e| SeglakeError::fatal(format!("manifest fetch: bad base64: {e}")))?;
    let manifest = engine.store_manifest_bytes(bucket, key, version_id, &bytes).await?;
    Ok(manifest)
}

async fn backfill_chunk(
    engine: &Engine,
    client: &reqwest::Client,
    peer: &RemotePeer,
    chunk: &crate::manifest::ChunkRef,
    policy: BackfillRetryPolicy,
) -> Result<()> {
    let deadline = Instant::now() + policy.deadline;
    let mut delay = policy.initial_delay;
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        if Instant::now() >= deadline {
            break;
        }
        let url = format!(
            "{}/v1/replication/chunk?segment_id={}&offset={}",
            peer.base_url, chunk.segment_id, chunk.offset
        );
        match client.get(&url).send().await.and_then(|r| r.error_for_status()) {
            Ok(resp) => match resp.json::<ChunkFetchResponse>().await {
                Ok(body) => match BASE64.decode(body.data_b64) {
                    Ok(data) => {
                        return engine.write_chunk_at(&chunk.segment_id, chunk.offset, &chunk.hash, &data).await;
                    }
                    Err(e) => last_err = Some(SeglakeError::fatal(format!("chunk fetch: bad base64: {e}"))),
                },
                Err(e) => last_err = Some(SeglakeError::from(e)),
            },
            Err(e) => last_err = Some(SeglakeError::from(e)),
        }
        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(last_err.unwrap_or_else(|| SeglakeError::fatal("chunk backfill exhausted retries")))
}

fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_escapes_reserved_characters() {
        assert_eq!(urlencoding_encode("my/key.txt"), "my%2Fkey.txt");
        assert_eq!(urlencoding_encode("plain"), "plain");
    }
}
