use std::time::Duration;

use seglake::config::{DataDirLayout, EngineConfig};
use seglake::{ops, Engine};

async fn open_engine() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataDirLayout::new(dir.path());
    let config = EngineConfig {
        site_id: "site-ops".to_string(),
        max_segment_bytes: 64 * 1024,
        ..Default::default()
    };
    let engine = Engine::open(layout, config).await.unwrap();
    (dir, engine)
}

#[tokio::test]
async fn scrub_flags_a_corrupted_chunk_and_marks_the_version_damaged() {
    let (_dir, engine) = open_engine().await;
    engine.create_bucket("b").await.unwrap();
    let put = engine.put_object("b", "k", None, b"some object payload bytes").await.unwrap();

    // Corrupt the underlying segment bytes directly, bypassing the
    // engine, to simulate bit rot.
    let segments_dir = engine.layout.segments_dir();
    let mut entries = tokio::fs::read_dir(&segments_dir).await.unwrap();
    let mut flipped = false;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let path = entry.path();
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        if bytes.len() > 64 {
            bytes[48] ^= 0xFF;
            tokio::fs::write(&path, &bytes).await.unwrap();
            flipped = true;
        }
    }
    assert!(flipped, "expected at least one segment file to corrupt");

    let report = ops::scrub::run(&engine).await.unwrap();
    let damaged = report.summary["damaged_versions"].as_array().unwrap();
    assert!(!damaged.is_empty());
    assert_eq!(damaged[0]["version_id"].as_str().unwrap(), put.version_id);
}

#[tokio::test]
async fn fsck_reports_a_manifest_whose_segment_is_too_short() {
    let (_dir, engine) = open_engine().await;
    engine.create_bucket("b").await.unwrap();
    engine.put_object("b", "k", None, b"payload").await.unwrap();

    let segments_dir = engine.layout.segments_dir();
    let mut entries = tokio::fs::read_dir(&segments_dir).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let path = entry.path();
        let truncated = std::fs::metadata(&path).unwrap().len() / 2;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(truncated).unwrap();
    }

    let report = ops::fsck::run(&engine).await.unwrap();
    assert_eq!(report.summary["ok"].as_bool(), Some(false));
    assert!(!report.summary["short_segments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn gc_plan_and_run_only_reclaim_segments_older_than_min_age() {
    let dir = tempfile::tempdir().unwrap();
    let layout = seglake::config::DataDirLayout::new(dir.path());
    let config = EngineConfig {
        site_id: "site-ops-gc".to_string(),
        max_segment_bytes: 64 * 1024,
        ..Default::default()
    };
    let engine = Engine::open(layout.clone(), config.clone()).await.unwrap();
    engine.create_bucket("b").await.unwrap();
    engine.put_object("b", "k", None, b"to be orphaned").await.unwrap();
    engine.shutdown().await.unwrap();
    drop(engine);

    // Reopening runs crash recovery, which is what actually promotes
    // the segment's metadata row from OPEN to SEALED; gc only considers
    // SEALED segments eligible.
    let engine = Engine::open(layout, config).await.unwrap();

    // Deleting the manifest file directly (not through delete_object,
    // which only flips SQL state) is what actually makes a segment's
    // chunks unreferenced from gc's point of view: it walks manifest
    // files on disk, not the metadata table.
    let mut manifests = tokio::fs::read_dir(engine.layout.manifests_dir()).await.unwrap();
    while let Some(entry) = manifests.next_entry().await.unwrap() {
        if entry.file_type().await.unwrap().is_file() {
            tokio::fs::remove_file(entry.path()).await.unwrap();
        }
    }

    // Freshly written/sealed: min_age of one hour must exclude it.
    let plan_fresh = ops::gc::plan(&engine, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(plan_fresh.summary["segments"].as_array().unwrap().len(), 0);

    let plan_now = ops::gc::plan(&engine, Duration::from_secs(0)).await.unwrap();
    assert!(!plan_now.summary["segments"].as_array().unwrap().is_empty());

    let run_report = ops::gc::run(&engine, Duration::from_secs(0)).await.unwrap();
    assert!(run_report.summary["reclaimed_bytes"].as_i64().unwrap() > 0);

    let segments_dir = engine.layout.segments_dir();
    let mut entries = tokio::fs::read_dir(&segments_dir).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none(), "dead segment should have been removed");
}

#[tokio::test]
async fn mpu_gc_aborts_uploads_older_than_the_cutoff() {
    let (_dir, engine) = open_engine().await;
    engine.create_bucket("b").await.unwrap();
    let upload_id = engine.create_multipart_upload("b", "k", None).await.unwrap();
    engine.upload_part("b", "k", &upload_id, 1, b"part one bytes").await.unwrap();

    // older_than(0) means "everything not touched in the last zero
    // seconds", i.e. everything outstanding right now.
    let report = ops::mpu_gc::run(&engine, Duration::from_secs(0)).await.unwrap();
    assert!(report.summary["uploads_aborted"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn rebuild_index_reconstructs_objects_current_from_manifests_alone() {
    let (_dir, engine) = open_engine().await;
    engine.create_bucket("b").await.unwrap();
    engine.put_object("b", "k1", None, b"first object").await.unwrap();
    engine.put_object("b", "k2", None, b"second object").await.unwrap();
    engine.shutdown().await.unwrap();

    let report = ops::rebuild::run(&engine).await.unwrap();
    assert!(report.summary["versions_restored"].as_u64().unwrap_or(0) >= 2);

    let got = engine.get_object("b", "k1").await.unwrap();
    assert_eq!(got.data, b"first object");
    let got2 = engine.get_object("b", "k2").await.unwrap();
    assert_eq!(got2.data, b"second object");
}
