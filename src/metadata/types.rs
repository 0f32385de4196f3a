//! Row types for the metadata store.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionState {
    Active,
    Damaged,
    Deleted,
    DeleteMarker,
    Conflict,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionState::Active => "ACTIVE",
            VersionState::Damaged => "DAMAGED",
            VersionState::Deleted => "DELETED",
            VersionState::DeleteMarker => "DELETE_MARKER",
            VersionState::Conflict => "CONFLICT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => VersionState::Active,
            "DAMAGED" => VersionState::Damaged,
            "DELETED" => VersionState::Deleted,
            "DELETE_MARKER" => VersionState::DeleteMarker,
            "CONFLICT" => VersionState::Conflict,
            _ => return None,
        })
    }

    pub fn is_current_eligible(&self) -> bool {
        matches!(self, VersionState::Active | VersionState::DeleteMarker)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRow {
    pub version_id: String,
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
    pub size: i64,
    pub content_type: Option<String>,
    pub last_modified_utc: String,
    pub hlc_ts: String,
    pub site_id: String,
    pub state: VersionState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketVersioning {
    Unset,
    Enabled,
    Suspended,
    Disabled,
}

impl BucketVersioning {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketVersioning::Unset => "UNSET",
            BucketVersioning::Enabled => "ENABLED",
            BucketVersioning::Suspended => "SUSPENDED",
            BucketVersioning::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "UNSET" => BucketVersioning::Unset,
            "ENABLED" => BucketVersioning::Enabled,
            "SUSPENDED" => BucketVersioning::Suspended,
            "DISABLED" => BucketVersioning::Disabled,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub bucket: String,
    pub created_at: String,
    pub versioning: BucketVersioning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub access_key: String,
    pub secret_hash: String,
    pub salt: String,
    pub enabled: bool,
    pub policy: Option<String>,
    pub inflight_limit: Option<i64>,
    pub created_at: String,
    pub label: Option<String>,
    pub last_used_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultipartUploadState {
    Active,
    Aborted,
}

impl MultipartUploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultipartUploadState::Active => "ACTIVE",
            MultipartUploadState::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => MultipartUploadState::Active,
            "ABORTED" => MultipartUploadState::Aborted,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub created_at: String,
    pub state: MultipartUploadState,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub upload_id: String,
    pub part_number: i64,
    pub version_id: String,
    pub etag: String,
    pub size: i64,
    pub last_modified: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentRow {
    pub segment_id: String,
    pub state: String,
    pub size: i64,
    pub created_at: String,
    pub sealed_at: Option<String>,
    pub footer_checksum: Option<String>,
}
