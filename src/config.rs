use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk layout rooted at a single data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDirLayout {
    pub root: PathBuf,
}

impl DataDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn meta_db(&self) -> PathBuf {
        self.root.join("meta.db")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".seglake.lock")
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.root.join(".seglake-admin.sock")
    }

    pub fn admin_token(&self) -> PathBuf {
        self.root.join(".seglake-admin.token")
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join("objects").join("segments")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("objects").join("manifests")
    }

    pub fn mpu_manifests_dir(&self) -> PathBuf {
        self.manifests_dir().join("mpu")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn support_dir(&self) -> PathBuf {
        self.root.join("support")
    }

    pub fn segment_path(&self, segment_id: &str) -> PathBuf {
        self.segments_dir().join(segment_id)
    }

    /// Create every directory this layout names, if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.segments_dir(),
            self.manifests_dir(),
            self.mpu_manifests_dir(),
            self.snapshots_dir(),
            self.support_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl AsRef<Path> for DataDirLayout {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}

/// Tunables for the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Chunker target chunk size.
    pub chunk_size: usize,
    /// Segment seal threshold by size.
    pub max_segment_bytes: u64,
    /// Segment seal threshold by age.
    pub max_segment_age: Duration,
    /// Write barrier flush interval.
    pub barrier_interval: Duration,
    /// Write barrier byte threshold.
    pub barrier_max_bytes: u64,
    /// Site identity stamped on every HLC-bearing row this engine writes.
    pub site_id: String,
    /// Heartbeat write interval.
    pub heartbeat_interval: Duration,
    /// Staleness threshold for a lock file.
    pub heartbeat_stale_after: Duration,
    /// Per-request HTTP timeout for replication clients.
    pub replication_request_timeout: Duration,
    /// Global deadline for chunk back-fill of one pull iteration.
    pub replication_retry_timeout: Duration,
    /// Watch-mode idle interval.
    pub replication_interval: Duration,
    /// Watch-mode backoff cap on error.
    pub replication_backoff_max: Duration,
    /// gc-rewrite default live/size threshold.
    pub gc_rewrite_live_threshold: f64,
    /// gc-rewrite target segment rotation size.
    pub gc_rewrite_target_segment_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            max_segment_bytes: 1024 * 1024 * 1024,
            max_segment_age: Duration::from_secs(10 * 60),
            barrier_interval: Duration::from_millis(100),
            barrier_max_bytes: 128 * 1024 * 1024,
            site_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_stale_after: Duration::from_secs(15),
            replication_request_timeout: Duration::from_secs(30),
            replication_retry_timeout: Duration::from_secs(5 * 60),
            replication_interval: Duration::from_secs(30),
            replication_backoff_max: Duration::from_secs(60),
            gc_rewrite_live_threshold: 0.5,
            gc_rewrite_target_segment_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_size, 4 * 1024 * 1024);
        assert_eq!(cfg.max_segment_bytes, 1024 * 1024 * 1024);
        assert_eq!(cfg.max_segment_age, Duration::from_secs(600));
        assert_eq!(cfg.barrier_interval, Duration::from_millis(100));
        assert_eq!(cfg.barrier_max_bytes, 128 * 1024 * 1024);
        assert_eq!(cfg.heartbeat_stale_after, Duration::from_secs(15));
        assert_eq!(cfg.gc_rewrite_live_threshold, 0.5);
    }

    #[test]
    fn data_dir_layout_paths() {
        let layout = DataDirLayout::new("/var/lib/seglake");
        assert_eq!(layout.meta_db(), PathBuf::from("/var/lib/seglake/meta.db"));
        assert_eq!(
            layout.segments_dir(),
            PathBuf::from("/var/lib/seglake/objects/segments")
        );
        assert_eq!(
            layout.manifests_dir(),
            PathBuf::from("/var/lib/seglake/objects/manifests")
        );
        assert_eq!(
            layout.segment_path("abc123"),
            PathBuf::from("/var/lib/seglake/objects/segments/abc123")
        );
    }

    #[test]
    fn data_dir_layout_ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DataDirLayout::new(tmp.path());
        layout.ensure().unwrap();
        assert!(layout.segments_dir().is_dir());
        assert!(layout.manifests_dir().is_dir());
        assert!(layout.mpu_manifests_dir().is_dir());
        assert!(layout.snapshots_dir().is_dir());
        assert!(layout.support_dir().is_dir());
    }

    #[test]
    fn custom_engine_config_construction() {
        let cfg = EngineConfig {
            chunk_size: 1024,
            max_segment_bytes: 2048,
            ..Default::default()
        };
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.max_segment_bytes, 2048);
        // untouched fields keep defaults
        assert_eq!(cfg.barrier_interval, Duration::from_millis(100));
    }
}
