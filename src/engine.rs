//! The `Engine` facade: the one type that ties chunking, segment
//! storage, the write barrier, and the metadata store into put/get/
//! delete/list plus the bucket, API-key, and multipart-upload
//! administration surfaces.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::barrier::{MetaFlusher, WriteBarrier};
use crate::chunker::Chunker;
use crate::config::{DataDirLayout, EngineConfig};
use crate::error::{Result, SeglakeError};
use crate::id::{manifest_filename, new_id, parse_manifest_filename};
use crate::manifest::{ChunkRef, Manifest};
use crate::metadata::{ApiKey, Bucket, BucketVersioning, MetadataStore, MultipartPart, MultipartUpload, MultipartUploadState};
use crate::segment::manager::recover_segment_file;
use crate::segment::manager::RecoveryOutcome;
use crate::segment::SegmentManager;

#[derive(Debug)]
pub struct PutResult {
    pub version_id: String,
    pub etag: String,
    pub size: i64,
}

#[derive(Debug)]
pub struct GetResult {
    pub version_id: String,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub size: i64,
    pub data: Vec<u8>,
}

pub struct Engine {
    pub layout: DataDirLayout,
    pub config: EngineConfig,
    pub meta: Arc<MetadataStore>,
    segments: Arc<SegmentManager>,
    barrier: Arc<WriteBarrier>,
}

impl Engine {
    pub async fn open(layout: DataDirLayout, config: EngineConfig) -> Result<Self> {
        layout.ensure()?;
        let meta = Arc::new(MetadataStore::open(&layout.meta_db(), config.site_id.clone(), 4)?);
        let segments = Arc::new(SegmentManager::new(
            layout.segments_dir(),
            config.max_segment_bytes,
            config.max_segment_age,
        ));
        let barrier = WriteBarrier::new(
            config.barrier_interval,
            config.barrier_max_bytes,
            segments.clone(),
            meta.clone() as Arc<dyn MetaFlusher>,
        );

        let engine = Self {
            layout,
            config,
            meta,
            segments,
            barrier,
        };
        engine.recover_open_segments().await?;
        Ok(engine)
    }

    /// For every segment metadata last saw OPEN, decide whether the file
    /// on disk ended cleanly (promote to SEALED) or mid-record (leave
    /// OPEN for `fsck`/`scrub` to repair; this engine instance starts a
    /// fresh active segment rather than resuming into a truncated tail).
    async fn recover_open_segments(&self) -> Result<()> {
        for row in self.meta.list_open_segments().await? {
            let path = self.layout.segment_path(&row.segment_id);
            if !path.exists() {
                continue;
            }
            match recover_segment_file(&path)? {
                RecoveryOutcome::AlreadySealed => {
                    let size = tokio::fs::metadata(&path).await?.len() as i64;
                    self.meta.record_segment(&row.segment_id, "SEALED", size, true).await?;
                }
                RecoveryOutcome::PromotedToSealed { new_size } => {
                    self.meta.record_segment(&row.segment_id, "SEALED", new_size as i64, true).await?;
                    tracing::info!(segment_id = %row.segment_id, "promoted open segment to sealed on recovery");
                }
                RecoveryOutcome::StillOpen => {
                    tracing::warn!(segment_id = %row.segment_id, "segment left open after truncated record; needs fsck repair");
                }
            }
        }
        Ok(())
    }

    fn manifest_path(&self, bucket: &str, key: &str, version_id: &str) -> PathBuf {
        self.layout.manifests_dir().join(manifest_filename(bucket, key, version_id))
    }

    // ---- buckets -------------------------------------------------------

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket_name(bucket)?;
        self.meta.create_bucket(bucket).await
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.meta.bucket_exists(bucket).await
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        self.meta.list_buckets().await
    }

    pub async fn set_bucket_versioning(&self, bucket: &str, versioning: BucketVersioning) -> Result<()> {
        if !self.meta.bucket_exists(bucket).await? {
            return Err(SeglakeError::not_found(format!("bucket {bucket}")));
        }
        self.meta.set_bucket_versioning(bucket, versioning).await
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let objects = self.meta.list_objects(bucket, "", "", 1).await?;
        if !objects.is_empty() {
            return Err(SeglakeError::invalid_argument(format!("bucket {bucket} is not empty")));
        }
        self.meta.force_delete_bucket(bucket).await
    }

    /// Deletes the bucket row and every object/version row under it,
    /// bypassing the emptiness check `delete_bucket` enforces. Does not
    /// touch segment files on disk — `gc` reclaims their chunks once no
    /// manifest references them.
    pub async fn force_delete_bucket(&self, bucket: &str) -> Result<()> {
        self.meta.force_delete_bucket(bucket).await
    }

    pub async fn put_bucket_policy(&self, bucket: &str, policy_json: &str) -> Result<()> {
        if !self.meta.bucket_exists(bucket).await? {
            return Err(SeglakeError::not_found(format!("bucket {bucket}")));
        }
        self.meta.put_bucket_policy(bucket, policy_json).await
    }

    pub async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<String>> {
        self.meta.get_bucket_policy(bucket).await
    }

    // ---- object put / get / delete / list ------------------------------

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<PutResult> {
        if !self.meta.bucket_exists(bucket).await? {
            return Err(SeglakeError::not_found(format!("bucket {bucket}")));
        }

        let mut chunker = Chunker::new(Cursor::new(data), self.config.chunk_size);
        let mut chunk_refs = Vec::new();
        let mut touched_segments = std::collections::HashSet::new();

        while let Some(chunk) = chunker.next_chunk()? {
            let append = self.segments.append_chunk(&chunk.hash, &chunk.data).await?;
            self.barrier.add_bytes(chunk.data.len() as u64).await;
            touched_segments.insert(append.segment_id.clone());
            chunk_refs.push(ChunkRef {
                index: chunk.index,
                hash: chunk.hash,
                segment_id: append.segment_id,
                offset: append.offset,
                len: chunk.data.len() as u32,
            });
        }

        let version_id = new_id();
        let etag = hex::encode(Md5::digest(data));
        let manifest = Manifest::from_chunks(bucket, key, &version_id, chunk_refs);
        tokio::fs::write(self.manifest_path(bucket, key, &version_id), manifest.encode()).await?;

        for segment_id in &touched_segments {
            self.meta.record_segment(segment_id, "OPEN", 0, false).await?;
        }

        let site_id = self.config.site_id.clone();
        let (bucket_owned, key_owned, version_owned, etag_owned, content_type_owned) = (
            bucket.to_string(),
            key.to_string(),
            version_id.clone(),
            etag.clone(),
            content_type.map(str::to_string),
        );
        let size = manifest.size;
        self.barrier
            .register(Box::new(move |tx| {
                MetadataStore::record_put_tx(
                    tx,
                    &site_id,
                    &bucket_owned,
                    &key_owned,
                    &version_owned,
                    &etag_owned,
                    size,
                    content_type_owned.as_deref(),
                )
                .map(|_| ())
            }))
            .await;
        self.barrier.wait().await?;

        Ok(PutResult { version_id, etag, size })
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<GetResult> {
        let current = self
            .meta
            .get_current_version(bucket, key)
            .await?
            .ok_or_else(|| SeglakeError::not_found(format!("{bucket}/{key}")))?;
        if !current.state.is_current_eligible() {
            return Err(SeglakeError::not_found(format!("{bucket}/{key}")));
        }
        let manifest = self.read_manifest(bucket, key, &current.version_id).await?;
        let data = self.read_manifest_bytes(&manifest, 0, manifest.size as u64).await?;
        Ok(GetResult {
            version_id: current.version_id,
            etag: current.etag,
            content_type: current.content_type,
            size: manifest.size,
            data,
        })
    }

    pub async fn get_object_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<GetResult> {
        let current = self
            .meta
            .get_current_version(bucket, key)
            .await?
            .ok_or_else(|| SeglakeError::not_found(format!("{bucket}/{key}")))?;
        let manifest = self.read_manifest(bucket, key, &current.version_id).await?;
        if start > end || end as i64 > manifest.size {
            return Err(SeglakeError::invalid_argument("range out of bounds"));
        }
        let data = self.read_manifest_bytes(&manifest, start, end - start).await?;
        Ok(GetResult {
            version_id: current.version_id,
            etag: current.etag,
            content_type: current.content_type,
            size: (end - start) as i64,
            data,
        })
    }

    async fn read_manifest(&self, bucket: &str, key: &str, version_id: &str) -> Result<Manifest> {
        let bytes = tokio::fs::read(self.manifest_path(bucket, key, version_id)).await?;
        Manifest::decode(&bytes, bucket, key)
    }

    /// Read `len` bytes starting at logical offset `start` within the
    /// object, walking the chunk list and verifying each chunk's hash as
    /// it is read.
    async fn read_manifest_bytes(&self, manifest: &Manifest, start: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let mut logical = 0u64;
        let end = start + len;
        for chunk in &manifest.chunks {
            let chunk_start = logical;
            let chunk_end = logical + chunk.len as u64;
            logical = chunk_end;
            if chunk_end <= start || chunk_start >= end {
                continue;
            }
            let data = self.read_chunk(chunk).await?;
            let lo = start.saturating_sub(chunk_start) as usize;
            let hi = (end.min(chunk_end) - chunk_start) as usize;
            out.extend_from_slice(&data[lo..hi]);
        }
        Ok(out)
    }

    /// MD5 of the object stream reconstructed from a manifest's chunks,
    /// in chunk order, verifying each chunk's BLAKE3 hash as it is read.
    /// Used where the full object body is no longer held in memory (the
    /// multipart stitch and rebuild-index, which only have manifests).
    pub(crate) async fn manifest_md5(&self, manifest: &Manifest) -> Result<String> {
        let mut hasher = Md5::new();
        for chunk in &manifest.chunks {
            let data = self.read_chunk(chunk).await?;
            hasher.update(&data);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    async fn read_chunk(&self, chunk_ref: &ChunkRef) -> Result<Vec<u8>> {
        let path = self.layout.segment_path(&chunk_ref.segment_id);
        let mut file = tokio::fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(chunk_ref.offset as u64)).await?;
        let mut buf = vec![0u8; chunk_ref.len as usize];
        file.read_exact(&mut buf).await?;
        let actual = *blake3::hash(&buf).as_bytes();
        if actual != chunk_ref.hash {
            return Err(SeglakeError::integrity(format!(
                "chunk hash mismatch in segment {} at offset {}",
                chunk_ref.segment_id, chunk_ref.offset
            )));
        }
        Ok(buf)
    }

    pub async fn list_objects(&self, bucket: &str, prefix: &str, after: &str, limit: i64) -> Result<Vec<(String, String)>> {
        self.meta.list_objects(bucket, prefix, after, limit).await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        let bucket_row = self
            .meta
            .list_buckets()
            .await?
            .into_iter()
            .find(|b| b.bucket == bucket)
            .ok_or_else(|| SeglakeError::not_found(format!("bucket {bucket}")))?;

        match bucket_row.versioning {
            BucketVersioning::Enabled | BucketVersioning::Suspended => {
                let marker = self.meta.delete_object_marker(bucket, key).await?;
                Ok(Some(marker))
            }
            BucketVersioning::Unset | BucketVersioning::Disabled => {
                if let Some(current) = self.meta.get_current_version(bucket, key).await? {
                    self.meta.delete_object_version(bucket, key, &current.version_id).await?;
                }
                Ok(None)
            }
        }
    }

    pub async fn delete_object_version(&self, bucket: &str, key: &str, version_id: &str) -> Result<()> {
        self.meta.delete_object_version(bucket, key, version_id).await
    }

    // ---- api keys --------------------------------------------------------

    pub async fn create_api_key(&self, label: Option<&str>, policy: Option<&str>, inflight_limit: Option<i64>) -> Result<(String, String)> {
        let access_key = format!("SGLK{}", &new_id()[..16]);
        let secret = new_id() + &new_id();
        let salt = new_id();
        let secret_hash = hash_secret(&salt, &secret);
        self.meta
            .create_api_key(ApiKey {
                access_key: access_key.clone(),
                secret_hash,
                salt,
                enabled: true,
                policy: policy.map(str::to_string),
                inflight_limit,
                created_at: iso_now(),
                label: label.map(str::to_string),
                last_used_at: None,
            })
            .await?;
        Ok((access_key, secret))
    }

    pub async fn verify_api_key(&self, access_key: &str, secret: &str) -> Result<bool> {
        let key = self.meta.get_api_key(access_key).await?;
        Ok(match key {
            Some(k) if k.enabled => hash_secret(&k.salt, secret) == k.secret_hash,
            _ => false,
        })
    }

    pub async fn revoke_api_key(&self, access_key: &str) -> Result<()> {
        self.meta.revoke_api_key(access_key).await
    }

    pub async fn allow_bucket_for_key(&self, access_key: &str, bucket: &str) -> Result<()> {
        if !self.meta.bucket_exists(bucket).await? {
            return Err(SeglakeError::not_found(format!("bucket {bucket}")));
        }
        self.meta.allow_bucket_for_key(access_key, bucket).await
    }

    // ---- multipart uploads -------------------------------------------

    pub async fn create_multipart_upload(&self, bucket: &str, key: &str, content_type: Option<&str>) -> Result<String> {
        if !self.meta.bucket_exists(bucket).await? {
            return Err(SeglakeError::not_found(format!("bucket {bucket}")));
        }
        let upload_id = new_id();
        self.meta
            .create_multipart_upload(MultipartUpload {
                upload_id: upload_id.clone(),
                bucket: bucket.to_string(),
                key: key.to_string(),
                created_at: iso_now(),
                state: MultipartUploadState::Active,
                content_type: content_type.map(str::to_string),
            })
            .await?;
        Ok(upload_id)
    }

    /// Stores one part's bytes under its own version so the eventual
    /// `complete` can stitch chunk refs together without re-chunking.
    pub async fn upload_part(&self, bucket: &str, key: &str, upload_id: &str, part_number: i64, data: &[u8]) -> Result<String> {
        let part_version_id = format!("{upload_id}-part{part_number}");
        let mut chunker = Chunker::new(Cursor::new(data), self.config.chunk_size);
        let mut chunk_refs = Vec::new();
        while let Some(chunk) = chunker.next_chunk()? {
            let append = self.segments.append_chunk(&chunk.hash, &chunk.data).await?;
            self.barrier.add_bytes(chunk.data.len() as u64).await;
            chunk_refs.push(ChunkRef {
                index: chunk.index,
                hash: chunk.hash,
                segment_id: append.segment_id,
                offset: append.offset,
                len: chunk.data.len() as u32,
            });
        }
        let etag = hex::encode(Md5::digest(data));
        let manifest = Manifest::from_chunks(bucket, key, &part_version_id, chunk_refs);
        tokio::fs::write(self.layout.mpu_manifests_dir().join(manifest_filename(bucket, key, &part_version_id)), manifest.encode())
            .await?;
        self.meta
            .put_multipart_part(MultipartPart {
                upload_id: upload_id.to_string(),
                part_number,
                version_id: part_version_id,
                etag: etag.clone(),
                size: manifest.size,
                last_modified: iso_now(),
            })
            .await?;
        Ok(etag)
    }

    /// Concatenates every uploaded part's chunk list, in part-number
    /// order, into a single final version's manifest.
    pub async fn complete_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<PutResult> {
        let parts = self.meta.list_multipart_parts(upload_id).await?;
        if parts.is_empty() {
            return Err(SeglakeError::invalid_argument("multipart upload has no parts"));
        }
        let mut chunks = Vec::new();
        let mut next_index = 0u32;
        for part in &parts {
            let bytes = tokio::fs::read(self.layout.mpu_manifests_dir().join(manifest_filename(bucket, key, &part.version_id))).await?;
            let part_manifest = Manifest::decode(&bytes, bucket, key)?;
            for mut chunk in part_manifest.chunks {
                chunk.index = next_index;
                next_index += 1;
                chunks.push(chunk);
            }
        }
        let version_id = new_id();
        let manifest = Manifest::from_chunks(bucket, key, &version_id, chunks);
        let etag = self.manifest_md5(&manifest).await?;
        tokio::fs::write(self.manifest_path(bucket, key, &version_id), manifest.encode()).await?;

        let site_id = self.config.site_id.clone();
        let (bucket_owned, key_owned, version_owned, etag_owned) = (bucket.to_string(), key.to_string(), version_id.clone(), etag.clone());
        let size = manifest.size;
        self.barrier
            .register(Box::new(move |tx| {
                MetadataStore::record_put_tx(tx, &site_id, &bucket_owned, &key_owned, &version_owned, &etag_owned, size, None).map(|_| ())
            }))
            .await;
        self.barrier.wait().await?;
        self.meta.set_multipart_state(upload_id, MultipartUploadState::Aborted).await?;

        Ok(PutResult { version_id, etag, size })
    }

    pub async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.meta.set_multipart_state(upload_id, MultipartUploadState::Aborted).await
    }

    pub async fn gc_multipart_uploads(&self, older_than: Duration) -> Result<u32> {
        let cutoff = iso_from_secs_ago(older_than);
        let stale = self.meta.list_stale_multipart_uploads(&cutoff).await?;
        let mut cleaned = 0u32;
        for upload in stale {
            if upload.state == MultipartUploadState::Aborted {
                continue;
            }
            self.meta.set_multipart_state(&upload.upload_id, MultipartUploadState::Aborted).await?;
            cleaned += 1;
        }
        Ok(cleaned)
    }

    // ---- replication support -------------------------------------------

    /// Chunks this manifest references that are not present (or not
    /// fully written) in the local segment files — the back-fill set a
    /// replication pull needs to fetch from the peer.
    pub async fn missing_chunks(&self, manifest: &Manifest) -> Result<Vec<ChunkRef>> {
        let mut missing = Vec::new();
        for chunk in &manifest.chunks {
            if self.read_chunk(chunk).await.is_err() {
                missing.push(chunk.clone());
            }
        }
        Ok(missing)
    }

    /// Writes one replicated chunk's bytes directly into its named
    /// segment file at its named offset, creating the file with a
    /// segment header first if it doesn't exist locally yet. Used only
    /// by replication back-fill, never by local writers (which always
    /// go through `SegmentManager`).
    pub async fn write_chunk_at(&self, segment_id: &str, offset: i64, hash: &[u8; 32], data: &[u8]) -> Result<()> {
        let actual = *blake3::hash(data).as_bytes();
        if actual != *hash {
            return Err(SeglakeError::integrity("replicated chunk hash mismatch"));
        }
        let path = self.layout.segment_path(segment_id);
        if !path.exists() {
            let header = crate::segment::format::SegmentHeader::new();
            tokio::fs::write(&path, header.encode()).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn store_manifest_bytes(&self, bucket: &str, key: &str, version_id: &str, bytes: &[u8]) -> Result<Manifest> {
        let manifest = Manifest::decode(bytes, bucket, key)?;
        tokio::fs::write(self.manifest_path(bucket, key, version_id), bytes).await?;
        Ok(manifest)
    }

    pub async fn manifest_bytes(&self, bucket: &str, key: &str, version_id: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.manifest_path(bucket, key, version_id)).await?)
    }

    pub async fn list_manifest_files(&self) -> Result<Vec<(String, String, String)>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(self.layout.manifests_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(parsed) = parse_manifest_filename(&name) {
                out.push(parsed);
            }
        }
        Ok(out)
    }

    // ---- lifecycle -----------------------------------------------------

    pub async fn shutdown(&self) -> Result<()> {
        self.segments.seal_current().await?;
        self.meta.flush().await
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.meta
    }

    pub fn segment_manager(&self) -> &Arc<SegmentManager> {
        &self.segments
    }
}

fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.is_empty() || bucket.len() > 63 {
        return Err(SeglakeError::invalid_argument("bucket name must be 1-63 characters"));
    }
    if !bucket.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.') {
        return Err(SeglakeError::invalid_argument("bucket name has invalid characters"));
    }
    Ok(())
}

fn hash_secret(salt: &str, secret: &str) -> String {
    let mut input = salt.as_bytes().to_vec();
    input.extend_from_slice(secret.as_bytes());
    hex::encode(blake3::hash(&input).as_bytes())
}

fn iso_now() -> String {
    iso_from_secs_ago(Duration::ZERO)
}

fn iso_from_secs_ago(ago: Duration) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let at = now.saturating_sub(ago);
    crate::metadata::httpdate_from_secs(at.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempdir().unwrap();
        let layout = DataDirLayout::new(dir.path());
        let config = EngineConfig {
            max_segment_bytes: 4096,
            ..Default::default()
        };
        let engine = Engine::open(layout, config).await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips_small_object() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let put = engine.put_object("b", "k", Some("text/plain"), b"hello world").await.unwrap();
        let got = engine.get_object("b", "k").await.unwrap();
        assert_eq!(got.data, b"hello world");
        assert_eq!(got.version_id, put.version_id);
        assert_eq!(got.etag.unwrap(), put.etag);
    }

    #[tokio::test]
    async fn put_rejects_missing_bucket() {
        let (_dir, engine) = open_engine().await;
        let err = engine.put_object("missing", "k", None, b"x").await.unwrap_err();
        assert!(matches!(err, SeglakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_range_returns_requested_slice_across_chunk_boundary() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        engine.put_object("b", "k", None, &data).await.unwrap();
        let range = engine.get_object_range("b", "k", 10, 20).await.unwrap();
        assert_eq!(range.data, &data[10..20]);
    }

    #[tokio::test]
    async fn unversioned_delete_removes_current_pointer() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        engine.put_object("b", "k", None, b"x").await.unwrap();
        engine.delete_object("b", "k").await.unwrap();
        let err = engine.get_object("b", "k").await.unwrap_err();
        assert!(matches!(err, SeglakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn versioned_bucket_delete_leaves_a_marker_but_object_not_current() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        engine.set_bucket_versioning("b", BucketVersioning::Enabled).await.unwrap();
        engine.put_object("b", "k", None, b"x").await.unwrap();
        let marker = engine.delete_object("b", "k").await.unwrap();
        assert!(marker.is_some());
        let err = engine.get_object("b", "k").await.unwrap_err();
        assert!(matches!(err, SeglakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn multipart_upload_completes_into_one_object() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let upload_id = engine.create_multipart_upload("b", "k", Some("application/octet-stream")).await.unwrap();
        engine.upload_part("b", "k", &upload_id, 1, b"part-one-").await.unwrap();
        engine.upload_part("b", "k", &upload_id, 2, b"part-two").await.unwrap();
        let result = engine.complete_multipart_upload("b", "k", &upload_id).await.unwrap();
        let got = engine.get_object("b", "k").await.unwrap();
        assert_eq!(got.data, b"part-one-part-two");
        assert_eq!(got.version_id, result.version_id);
    }

    #[tokio::test]
    async fn api_key_roundtrip_verifies_correct_secret_only() {
        let (_dir, engine) = open_engine().await;
        let (access_key, secret) = engine.create_api_key(Some("ci"), None, None).await.unwrap();
        assert!(engine.verify_api_key(&access_key, &secret).await.unwrap());
        assert!(!engine.verify_api_key(&access_key, "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn large_object_spans_multiple_segments_and_rotates() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let data = vec![9u8; 20_000];
        let put = engine.put_object("b", "k", None, &data).await.unwrap();
        let got = engine.get_object("b", "k").await.unwrap();
        assert_eq!(got.data.len(), data.len());
        assert_eq!(got.size, put.size);
    }

    #[tokio::test]
    async fn put_object_etag_is_md5_of_the_object_stream() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let data = b"hello world";
        let put = engine.put_object("b", "k", None, data).await.unwrap();
        assert_eq!(put.etag, hex::encode(Md5::digest(data)));
    }

    #[tokio::test]
    async fn multipart_completion_etag_is_md5_of_the_concatenated_parts() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let upload_id = engine.create_multipart_upload("b", "k", None).await.unwrap();
        engine.upload_part("b", "k", &upload_id, 1, b"part-one-").await.unwrap();
        engine.upload_part("b", "k", &upload_id, 2, b"part-two").await.unwrap();
        let result = engine.complete_multipart_upload("b", "k", &upload_id).await.unwrap();
        assert_eq!(result.etag, hex::encode(Md5::digest(b"part-one-part-two")));
    }

    #[tokio::test]
    async fn force_delete_bucket_removes_a_non_empty_bucket_and_its_objects() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        engine.put_object("b", "k1", None, b"one").await.unwrap();
        engine.put_object("b", "k2", None, b"two").await.unwrap();

        let err = engine.delete_bucket("b").await.unwrap_err();
        assert!(matches!(err, SeglakeError::InvalidArgument(_)));

        engine.force_delete_bucket("b").await.unwrap();
        assert!(!engine.bucket_exists("b").await.unwrap());
        assert!(engine.meta.get_current_version("b", "k1").await.unwrap().is_none());
        assert!(engine.meta.get_current_version("b", "k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bucket_policy_roundtrips_and_defaults_to_none() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        assert!(engine.get_bucket_policy("b").await.unwrap().is_none());
        engine.put_bucket_policy("b", r#"{"Version":"2012-10-17"}"#).await.unwrap();
        let policy = engine.get_bucket_policy("b").await.unwrap().unwrap();
        assert_eq!(policy, r#"{"Version":"2012-10-17"}"#);
    }

    #[tokio::test]
    async fn revoked_api_key_fails_verification() {
        let (_dir, engine) = open_engine().await;
        let (access_key, secret) = engine.create_api_key(None, None, None).await.unwrap();
        engine.revoke_api_key(&access_key).await.unwrap();
        assert!(!engine.verify_api_key(&access_key, &secret).await.unwrap());
    }

    #[tokio::test]
    async fn allow_bucket_for_key_is_recorded_in_the_metadata_store() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        let (access_key, _secret) = engine.create_api_key(None, None, None).await.unwrap();
        assert!(!engine.meta.bucket_allowed_for_key(&access_key, "b").await.unwrap());
        engine.allow_bucket_for_key(&access_key, "b").await.unwrap();
        assert!(engine.meta.bucket_allowed_for_key(&access_key, "b").await.unwrap());
    }

    #[tokio::test]
    async fn missing_chunks_flags_a_present_but_corrupted_chunk() {
        let (_dir, engine) = open_engine().await;
        engine.create_bucket("b").await.unwrap();
        engine.put_object("b", "k", None, b"some object payload bytes").await.unwrap();
        let current = engine.meta.get_current_version("b", "k").await.unwrap().unwrap();
        let manifest = engine.read_manifest("b", "k", &current.version_id).await.unwrap();

        let missing = engine.missing_chunks(&manifest).await.unwrap();
        assert!(missing.is_empty());

        let chunk_ref = &manifest.chunks[0];
        let path = engine.layout.segment_path(&chunk_ref.segment_id);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes[chunk_ref.offset as usize] ^= 0xFF;
        tokio::fs::write(&path, &bytes).await.unwrap();

        let missing = engine.missing_chunks(&manifest).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].segment_id, chunk_ref.segment_id);
    }
}
