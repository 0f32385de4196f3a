//! JSON wire types for the five `/v1/replication/*` endpoints.

use serde::{Deserialize, Serialize};

use crate::metadata::OplogEntry;

#[derive(Debug, Serialize, Deserialize)]
pub struct OplogPullResponse {
    pub entries: Vec<OplogEntry>,
    pub next_since: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OplogPushRequest {
    pub site_id: String,
    pub entries: Vec<OplogEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OplogPushResponse {
    pub applied: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub bytes: u64,
    pub generated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestFetchResponse {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    /// Base64-encoded encoded manifest bytes.
    pub manifest_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkFetchResponse {
    pub segment_id: String,
    pub offset: i64,
    pub hash_hex: String,
    /// Base64-encoded raw chunk payload.
    pub data_b64: String,
}
