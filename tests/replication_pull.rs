//! Exercises a pull against a peer served by a real axum router, so the
//! oplog fetch, manifest fetch, and chunk back-fill all go over actual
//! HTTP rather than calling engine methods directly.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use seglake::config::{DataDirLayout, EngineConfig};
use seglake::replication::wire::{ChunkFetchResponse, ManifestFetchResponse, OplogPullResponse};
use seglake::replication::{BackfillRetryPolicy, RemotePeer};
use seglake::{replication, Engine};
use serde::Deserialize;

async fn open_engine(site_id: &str) -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataDirLayout::new(dir.path());
    let config = EngineConfig {
        site_id: site_id.to_string(),
        ..Default::default()
    };
    let engine = Engine::open(layout, config).await.unwrap();
    (dir, engine)
}

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<String>,
}

async fn oplog_handler(State(engine): State<Arc<Engine>>, Query(q): Query<SinceQuery>) -> Json<OplogPullResponse> {
    let since = q.since.as_deref().and_then(seglake::Hlc::parse).unwrap_or(seglake::Hlc::MIN);
    let (entries, next_since) = engine.metadata().list_oplog_since(&since, 10_000).await.unwrap();
    Json(OplogPullResponse {
        entries,
        next_since: next_since.format(),
    })
}

#[derive(Deserialize)]
struct ManifestQuery {
    bucket: String,
    key: String,
    version_id: String,
}

async fn manifest_handler(State(engine): State<Arc<Engine>>, Query(q): Query<ManifestQuery>) -> Json<ManifestFetchResponse> {
    let bytes = engine.manifest_bytes(&q.bucket, &q.key, &q.version_id).await.unwrap();
    Json(ManifestFetchResponse {
        bucket: q.bucket,
        key: q.key,
        version_id: q.version_id,
        manifest_b64: BASE64.encode(bytes),
    })
}

#[derive(Deserialize)]
struct ChunkQuery {
    segment_id: String,
    offset: i64,
}

async fn chunk_handler(State(engine): State<Arc<Engine>>, Query(q): Query<ChunkQuery>) -> Json<ChunkFetchResponse> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    // length is recovered from the manifest in a real deployment; for
    // this test server we just read to EOF of a small fixed-size probe.
    let path = engine.layout.segment_path(&q.segment_id);
    let mut file = tokio::fs::File::open(&path).await.unwrap();
    file.seek(std::io::SeekFrom::Start(q.offset as u64)).await.unwrap();
    let mut data = Vec::new();
    file.read_to_end(&mut data).await.unwrap();
    let hash_hex = hex::encode(blake3::hash(&data).as_bytes());
    Json(ChunkFetchResponse {
        segment_id: q.segment_id,
        offset: q.offset,
        hash_hex,
        data_b64: BASE64.encode(data),
    })
}

async fn spawn_peer_server(engine: Arc<Engine>) -> String {
    let app = Router::new()
        .route("/v1/replication/oplog", get(oplog_handler))
        .route("/v1/replication/manifest", get(manifest_handler))
        .route("/v1/replication/chunk", get(chunk_handler))
        .with_state(engine);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn pull_once_applies_remote_oplog_and_backfills_missing_chunks() {
    let (_peer_dir, peer_engine) = open_engine("site-peer").await;
    peer_engine.create_bucket("shared").await.unwrap();
    peer_engine
        .put_object("shared", "doc.txt", Some("text/plain"), b"replicated payload bytes")
        .await
        .unwrap();
    let peer_engine = Arc::new(peer_engine);
    let base_url = spawn_peer_server(peer_engine.clone()).await;

    let (_local_dir, local_engine) = open_engine("site-local").await;
    local_engine.create_bucket("shared").await.unwrap();

    let peer = RemotePeer { base_url };
    let outcome = replication::pull::pull_once(&local_engine, &reqwest::Client::new(), &peer, BackfillRetryPolicy::default())
        .await
        .unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.chunks_failed, 0);
    assert!(outcome.chunks_backfilled >= 1);

    let got = local_engine.get_object("shared", "doc.txt").await.unwrap();
    assert_eq!(got.data, b"replicated payload bytes");
}

#[tokio::test]
async fn pull_once_is_idempotent_across_repeated_calls() {
    let (_peer_dir, peer_engine) = open_engine("site-peer2").await;
    peer_engine.create_bucket("shared").await.unwrap();
    peer_engine.put_object("shared", "a.txt", None, b"one").await.unwrap();
    let peer_engine = Arc::new(peer_engine);
    let base_url = spawn_peer_server(peer_engine.clone()).await;

    let (_local_dir, local_engine) = open_engine("site-local2").await;
    local_engine.create_bucket("shared").await.unwrap();
    let peer = RemotePeer { base_url };

    let first = replication::pull::pull_once(&local_engine, &reqwest::Client::new(), &peer, BackfillRetryPolicy::default())
        .await
        .unwrap();
    assert_eq!(first.applied, 1);

    let second = replication::pull::pull_once(&local_engine, &reqwest::Client::new(), &peer, BackfillRetryPolicy::default())
        .await
        .unwrap();
    assert_eq!(second.applied, 0);
}
