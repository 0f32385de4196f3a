//! `support-bundle`: packages a `status` report, the most recent GC
//! trend history, and the engine config into a single gzip tarball under
//! `support/`, for attaching to a bug report without shipping raw data.

use std::path::PathBuf;

use crate::engine::Engine;
use crate::error::{Result, SeglakeError};
use crate::ops::{now_iso, status, Report};

pub async fn run(engine: &Engine) -> Result<(Report, PathBuf)> {
    let started_at = now_iso();
    let status_report = status::run(engine).await?;
    let gc_trends = engine.metadata().list_gc_trends(20).await?;

    let bundle = serde_json::json!({
        "status": status_report,
        "gc_trends": gc_trends,
        "config": {
            "chunk_size": engine.config.chunk_size,
            "max_segment_bytes": engine.config.max_segment_bytes,
            "site_id": engine.config.site_id,
        },
    });
    let bundle_bytes = serde_json::to_vec_pretty(&bundle).map_err(|e| SeglakeError::fatal(e.to_string()))?;

    let bundle_name = format!("support-{}.tar.gz", crate::id::new_id());
    let out_path = engine.layout.support_dir().join(&bundle_name);
    let out_path_clone = out_path.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&out_path_clone)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(bundle_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "bundle.json", bundle_bytes.as_slice())
            .map_err(|e| SeglakeError::fatal(format!("support-bundle: {e}")))?;
        let encoder = builder
            .into_inner()
            .map_err(|e| SeglakeError::fatal(format!("support-bundle: finalizing tar: {e}")))?;
        encoder
            .finish()
            .map_err(|e| SeglakeError::fatal(format!("support-bundle: finalizing gzip: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| SeglakeError::fatal(format!("support-bundle task panicked: {e}")))??;

    let summary = serde_json::json!({ "path": out_path.to_string_lossy() });
    Ok((Report::new("support-bundle", started_at, summary), out_path))
}
