//! `snapshot`: checkpoints the metadata database and tars up `meta.db`
//! plus every manifest into a gzip archive under `snapshots/`, forming
//! the payload served by the replication bootstrap endpoint.

use std::path::PathBuf;

use crate::engine::Engine;
use crate::error::{Result, SeglakeError};
use crate::ops::{now_iso, Report};

pub async fn run(engine: &Engine) -> Result<(Report, PathBuf)> {
    let started_at = now_iso();
    engine.metadata().flush().await?;

    let snapshot_name = format!("snapshot-{}.tar.gz", crate::id::new_id());
    let out_path = engine.layout.snapshots_dir().join(&snapshot_name);
    let root = engine.layout.root.clone();
    let meta_db = engine.layout.meta_db();
    let manifests_dir = engine.layout.manifests_dir();
    let out_path_clone = out_path.clone();

    let bytes_written = tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = std::fs::File::create(&out_path_clone)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_path_with_name(&meta_db, "meta.db")
            .map_err(|e| SeglakeError::fatal(format!("snapshot: appending meta.db: {e}")))?;
        if manifests_dir.is_dir() {
            builder
                .append_dir_all("objects/manifests", &manifests_dir)
                .map_err(|e| SeglakeError::fatal(format!("snapshot: appending manifests: {e}")))?;
        }
        let encoder = builder
            .into_inner()
            .map_err(|e| SeglakeError::fatal(format!("snapshot: finalizing tar: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SeglakeError::fatal(format!("snapshot: finalizing gzip: {e}")))?;
        Ok(std::fs::metadata(&out_path_clone)?.len())
    })
    .await
    .map_err(|e| SeglakeError::fatal(format!("snapshot task panicked: {e}")))??;

    let _ = root;
    let summary = serde_json::json!({
        "path": out_path.to_string_lossy(),
        "bytes": bytes_written,
    });
    Ok((Report::new("snapshot", started_at, summary), out_path))
}
