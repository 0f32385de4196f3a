//! Bootstrap: pull a peer's full snapshot (`GET /v1/replication/snapshot`,
//! a tar.gz of `meta.db` plus every manifest) to seed a brand-new site
//! before it starts incremental oplog pulls. Untarring is "safe": every
//! entry path is checked to stay inside the target directory before
//! being written, rejecting `../` traversal or absolute paths a
//! malicious or buggy peer might send.

use std::path::{Component, Path, PathBuf};

use crate::config::DataDirLayout;
use crate::error::{Result, SeglakeError};
use crate::replication::RemotePeer;

pub async fn bootstrap_from_snapshot(layout: &DataDirLayout, client: &reqwest::Client, peer: &RemotePeer) -> Result<u64> {
    let url = format!("{}/v1/replication/snapshot", peer.base_url);
    let bytes = client.get(&url).send().await?.error_for_status()?.bytes().await?;
    let byte_len = bytes.len() as u64;

    let root = layout.root.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let decoder = flate2::read::GzDecoder::new(bytes.as_ref());
        let mut archive = tar::Archive::new(decoder);
        for entry in archive
            .entries()
            .map_err(|e| SeglakeError::fatal(format!("bootstrap: reading tar: {e}")))?
        {
            let mut entry = entry.map_err(|e| SeglakeError::fatal(format!("bootstrap: reading tar entry: {e}")))?;
            let entry_path = entry
                .path()
                .map_err(|e| SeglakeError::fatal(format!("bootstrap: bad entry path: {e}")))?
                .into_owned();
            let dest = safe_join(&root, &entry_path)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry
                .unpack(&dest)
                .map_err(|e| SeglakeError::fatal(format!("bootstrap: unpacking {}: {e}", dest.display())))?;
        }
        Ok(())
    })
    .await
    .map_err(|e| SeglakeError::fatal(format!("bootstrap task panicked: {e}")))??;

    Ok(byte_len)
}

fn safe_join(root: &Path, entry_path: &Path) -> Result<PathBuf> {
    let mut dest = root.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => dest.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SeglakeError::integrity(format!(
                    "snapshot entry escapes target directory: {}",
                    entry_path.display()
                )));
            }
        }
    }
    Ok(dest)
}
