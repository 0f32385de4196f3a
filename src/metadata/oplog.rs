//! Oplog entry wire format and the pure dedup/ordering logic `apply`
//! relies on. The actual application against the metadata store lives
//! in `metadata::mod` since it needs a live transaction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Put,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Put => "put",
            OpType::Delete => "delete",
        }
    }
}

/// One replicated write or delete. `payload` varies by `op_type`: for
/// `put` it is `{etag, size, last_modified, content_type}`; for
/// `delete` it is `{last_modified}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OplogEntry {
    pub site_id: String,
    pub hlc_ts: String,
    pub op_type: OpType,
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub bytes: i64,
}

impl OplogEntry {
    pub fn dedup_key(&self) -> (String, String) {
        (self.site_id.clone(), self.hlc_ts.clone())
    }
}

/// Dedup by `(site_id, hlc_ts)` and sort by `hlc_ts` so entries apply in
/// HLC order regardless of arrival order.
pub fn dedup_and_sort(entries: Vec<OplogEntry>) -> Vec<OplogEntry> {
    let mut seen = HashSet::new();
    let mut out: Vec<OplogEntry> = entries
        .into_iter()
        .filter(|e| seen.insert(e.dedup_key()))
        .collect();
    out.sort_by(|a, b| a.hlc_ts.cmp(&b.hlc_ts));
    out
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutPayload {
    pub etag: String,
    pub size: i64,
    pub last_modified: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletePayload {
    pub last_modified: String,
}
