//! Random 128-bit identifiers (version IDs, segment IDs) and the
//! base64url codec used to fold `(bucket, key)` into manifest filenames.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// A random 128-bit id, rendered as lowercase hex for filenames and SQL
/// primary keys.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn b64url_encode(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

pub fn b64url_decode(encoded: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Build the canonical manifest filename for `(bucket, key, version_id)`:
/// `<base64url(bucket)>__<base64url(key)>__<versionID>`.
pub fn manifest_filename(bucket: &str, key: &str, version_id: &str) -> String {
    format!(
        "{}__{}__{}",
        b64url_encode(bucket),
        b64url_encode(key),
        version_id
    )
}

/// Parse a manifest filename back into `(bucket, key, version_id)`.
/// Returns `None` if the name doesn't have the expected three-part shape
/// or either base64url component fails to decode.
pub fn parse_manifest_filename(name: &str) -> Option<(String, String, String)> {
    let mut parts = name.splitn(3, "__");
    let bucket_enc = parts.next()?;
    let key_enc = parts.next()?;
    let version_id = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let bucket = b64url_decode(bucket_enc)?;
    let key = b64url_decode(key_enc)?;
    Some((bucket, key, version_id.to_string()))
}
