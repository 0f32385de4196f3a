//! Push: send this site's oplog entries since the last acknowledged
//! push watermark to a peer's `/v1/replication/oplog` endpoint.

use crate::engine::Engine;
use crate::error::Result;
use crate::replication::wire::{OplogPushRequest, OplogPushResponse};
use crate::replication::RemotePeer;

pub struct PushOutcome {
    pub sent: usize,
    pub applied_by_peer: u32,
}

pub async fn push_once(engine: &Engine, client: &reqwest::Client, peer: &RemotePeer) -> Result<PushOutcome> {
    let (last_push, _) = engine.metadata().get_remote_watermarks(&peer.base_url).await?;
    let since = last_push.unwrap_or(crate::clock::Hlc::MIN);

    let (entries, last_hlc) = engine.metadata().list_oplog_since(&since, 10_000).await?;
    if entries.is_empty() {
        return Ok(PushOutcome {
            sent: 0,
            applied_by_peer: 0,
        });
    }

    let request = OplogPushRequest {
        site_id: engine.config.site_id.clone(),
        entries,
    };
    let sent = request.entries.len();

    let url = format!("{}/v1/replication/oplog", peer.base_url);
    let response: OplogPushResponse = client
        .post(&url)
        .timeout(engine.config.replication_request_timeout)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    engine.metadata().set_remote_push_watermark(&peer.base_url, &last_hlc).await?;
    tracing::info!(peer = %peer.base_url, sent, applied = response.applied, "replication push complete");
    Ok(PushOutcome {
        sent,
        applied_by_peer: response.applied,
    })
}
