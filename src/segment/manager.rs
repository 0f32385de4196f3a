//! Owns the single active (OPEN) segment for one engine instance:
//! appends are totally ordered into it, and it is sealed and rotated
//! by size or age. Readers never go through this type — they open
//! segment files directly once a manifest names an offset.

use std::io::Read as StdRead;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Result, SeglakeError};
use crate::id::new_id;
use crate::segment::bloom::BloomFilter;
use crate::segment::format::{
    self, Footer, SegmentHeader, FOOTER_LEN, RECORD_HEADER_LEN, SEGMENT_HEADER_LEN,
};
use crate::segment::index::Index;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Sealed,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentState::Open => "OPEN",
            SegmentState::Sealed => "SEALED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(SegmentState::Open),
            "SEALED" => Ok(SegmentState::Sealed),
            other => Err(SeglakeError::invalid_argument(format!(
                "unknown segment state: {other}"
            ))),
        }
    }
}

pub struct AppendResult {
    pub segment_id: String,
    pub offset: i64,
}

pub struct SealedSegment {
    pub segment_id: String,
    pub size: u64,
    pub footer_checksum: [u8; 32],
}

struct OpenSegment {
    id: String,
    file: tokio::fs::File,
    size: u64,
    created_at: Instant,
    /// `(payload offset, hash)` for every chunk record appended so far,
    /// used to build the bloom filter and index at seal time.
    records: Vec<(i64, [u8; 32])>,
}

struct Inner {
    current: Option<OpenSegment>,
}

pub struct SegmentManager {
    segments_dir: PathBuf,
    max_segment_bytes: u64,
    max_segment_age: Duration,
    inner: Mutex<Inner>,
}

impl SegmentManager {
    pub fn new(segments_dir: PathBuf, max_segment_bytes: u64, max_segment_age: Duration) -> Self {
        Self {
            segments_dir,
            max_segment_bytes,
            max_segment_age,
            inner: Mutex::new(Inner { current: None }),
        }
    }

    fn segment_path(&self, id: &str) -> PathBuf {
        self.segments_dir.join(id)
    }

    async fn open_new(&self) -> Result<OpenSegment> {
        let id = new_id();
        let path = self.segment_path(&id);
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)
            .await?;
        let header = SegmentHeader::new();
        file.write_all(&header.encode()).await?;
        file.flush().await?;
        Ok(OpenSegment {
            id,
            file,
            size: SEGMENT_HEADER_LEN,
            created_at: Instant::now(),
            records: Vec::new(),
        })
    }

    fn needs_rotation(&self, seg: &OpenSegment, incoming_len: u64) -> bool {
        let projected = seg.size + incoming_len + RECORD_HEADER_LEN;
        projected > self.max_segment_bytes || seg.created_at.elapsed() > self.max_segment_age
    }

    /// Seal `seg` in place: write a bloom filter and an index covering
    /// every chunk appended to it, then a footer pointing at both
    /// regions, fsync, and return its final size and checksum.
    async fn seal_with_index(seg: &mut OpenSegment) -> Result<SealedSegment> {
        let mut bloom = BloomFilter::new_for_count(seg.records.len().max(1));
        let mut index = Index::new();
        for (offset, hash) in &seg.records {
            bloom.insert(hash);
            index.push(*offset, *hash);
        }
        let bloom_bytes = bloom.encode();
        let index_bytes = index.encode();

        let bloom_off = seg.size as i64;
        seg.file.write_all(&bloom_bytes).await?;
        seg.size += bloom_bytes.len() as u64;

        let index_off = seg.size as i64;
        seg.file.write_all(&index_bytes).await?;
        seg.size += index_bytes.len() as u64;

        let mut footer = Footer::new(bloom_off, bloom_bytes.len() as i64, index_off, index_bytes.len() as i64);
        footer.finalize();
        seg.file.write_all(&footer.encode()).await?;
        seg.file.flush().await?;
        seg.file.sync_all().await?;
        seg.size += FOOTER_LEN;
        Ok(SealedSegment {
            segment_id: seg.id.clone(),
            size: seg.size,
            footer_checksum: footer.checksum,
        })
    }

    /// Append one chunk record, sealing and rotating the active segment
    /// first if it has no room or has aged out. Returns the payload
    /// offset (past the record header) so callers can build chunk refs.
    pub async fn append_chunk(&self, hash: &[u8; 32], data: &[u8]) -> Result<AppendResult> {
        let mut inner = self.inner.lock().await;
        let incoming_len = data.len() as u64;

        let needs_new = match &inner.current {
            None => true,
            Some(seg) => self.needs_rotation(seg, incoming_len),
        };

        if needs_new {
            if let Some(mut seg) = inner.current.take() {
                Self::seal_with_index(&mut seg).await?;
            }
            inner.current = Some(self.open_new().await?);
        }

        let seg = inner.current.as_mut().expect("segment just ensured open");
        let record = format::encode_record(hash, data)?;
        let offset = seg.size + RECORD_HEADER_LEN;
        seg.file.write_all(&record).await?;
        seg.size += record.len() as u64;
        seg.records.push((offset as i64, *hash));

        Ok(AppendResult {
            segment_id: seg.id.clone(),
            offset: offset as i64,
        })
    }

    /// fsync the active segment, if any.
    pub async fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(seg) = inner.current.as_mut() {
            seg.file.flush().await?;
            seg.file.sync_all().await?;
        }
        Ok(())
    }

    /// Seal the active segment if it has aged past the rotation
    /// threshold. Called by the write barrier after each flush so idle
    /// segments don't sit open indefinitely.
    pub async fn seal_if_idle(&self) -> Result<Option<SealedSegment>> {
        let mut inner = self.inner.lock().await;
        let should_seal = matches!(
            &inner.current,
            Some(seg) if seg.created_at.elapsed() > self.max_segment_age
        );
        if !should_seal {
            return Ok(None);
        }
        let mut seg = inner.current.take().unwrap();
        let sealed = Self::seal_with_index(&mut seg).await?;
        Ok(Some(sealed))
    }

    /// Force-seal the active segment unconditionally (used on clean
    /// shutdown).
    pub async fn seal_current(&self) -> Result<Option<SealedSegment>> {
        let mut inner = self.inner.lock().await;
        match inner.current.take() {
            None => Ok(None),
            Some(mut seg) => Ok(Some(Self::seal_with_index(&mut seg).await?)),
        }
    }
}

/// Outcome of examining one OPEN segment's file at startup.
#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The file already ends in a valid footer.
    AlreadySealed,
    /// Valid records ran cleanly to EOF; a fresh footer was appended.
    PromotedToSealed { new_size: u64 },
    /// A record header or its payload was truncated; left untouched.
    StillOpen,
}

/// Recover one segment file found OPEN in metadata at startup. Blocking:
/// this only runs once, synchronously, before the engine accepts writes.
pub fn recover_segment_file(path: &Path) -> Result<RecoveryOutcome> {
    let mut file = std::fs::File::open(path)?;
    let total_len = file.metadata()?.len();

    if total_len >= SEGMENT_HEADER_LEN + FOOTER_LEN {
        let mut tail = vec![0u8; FOOTER_LEN as usize];
        {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
            file.read_exact(&mut tail)?;
        }
        if Footer::decode(&tail).is_ok() {
            return Ok(RecoveryOutcome::AlreadySealed);
        }
    }

    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0))?;
    let mut header_buf = [0u8; SEGMENT_HEADER_LEN as usize];
    file.read_exact(&mut header_buf)?;
    SegmentHeader::decode(&header_buf)?;

    let mut cursor = SEGMENT_HEADER_LEN;
    let mut records = Vec::new();
    loop {
        let mut rec_header = [0u8; RECORD_HEADER_LEN as usize];
        match file.read_exact(&mut rec_header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // clean boundary: nothing left but a possible empty tail
                let pos = file.stream_position()?;
                if pos == total_len {
                    break;
                } else {
                    return Ok(RecoveryOutcome::StillOpen);
                }
            }
            Err(e) => return Err(e.into()),
        }
        let (hash, len) = format::decode_record_header(&rec_header)?;
        let mut payload = vec![0u8; len as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(RecoveryOutcome::StillOpen);
            }
            Err(e) => return Err(e.into()),
        }
        records.push((cursor as i64 + RECORD_HEADER_LEN as i64, hash));
        cursor += RECORD_HEADER_LEN + len as u64;
    }

    // clean EOF right after a full record: build bloom/index over the
    // records just scanned and append a fresh footer pointing at them.
    let mut bloom = BloomFilter::new_for_count(records.len().max(1));
    let mut index = Index::new();
    for (offset, hash) in &records {
        bloom.insert(hash);
        index.push(*offset, *hash);
    }
    let bloom_bytes = bloom.encode();
    let index_bytes = index.encode();
    let bloom_off = cursor as i64;
    let index_off = bloom_off + bloom_bytes.len() as i64;
    let mut footer = Footer::new(bloom_off, bloom_bytes.len() as i64, index_off, index_bytes.len() as i64);
    footer.finalize();
    {
        use std::io::Write;
        let mut writer = std::fs::OpenOptions::new().append(true).open(path)?;
        writer.write_all(&bloom_bytes)?;
        writer.write_all(&index_bytes)?;
        writer.write_all(&footer.encode())?;
        writer.flush()?;
        writer.sync_all()?;
    }
    Ok(RecoveryOutcome::PromotedToSealed {
        new_size: cursor + bloom_bytes.len() as u64 + index_bytes.len() as u64 + FOOTER_LEN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn chunk(n: u8, len: usize) -> ([u8; 32], Vec<u8>) {
        let data = vec![n; len];
        let hash = *blake3::hash(&data).as_bytes();
        (hash, data)
    }

    #[tokio::test]
    async fn append_opens_a_new_segment_on_first_call() {
        let dir = tempdir().unwrap();
        let mgr = SegmentManager::new(dir.path().to_path_buf(), 1024 * 1024, Duration::from_secs(600));
        let (hash, data) = chunk(1, 16);
        let result = mgr.append_chunk(&hash, &data).await.unwrap();
        assert_eq!(result.offset, SEGMENT_HEADER_LEN as i64 + RECORD_HEADER_LEN as i64);
        assert!(dir.path().join(&result.segment_id).exists());
    }

    #[tokio::test]
    async fn successive_appends_share_one_segment_until_threshold() {
        let dir = tempdir().unwrap();
        let mgr = SegmentManager::new(dir.path().to_path_buf(), 1024 * 1024, Duration::from_secs(600));
        let (h1, d1) = chunk(1, 16);
        let (h2, d2) = chunk(2, 16);
        let r1 = mgr.append_chunk(&h1, &d1).await.unwrap();
        let r2 = mgr.append_chunk(&h2, &d2).await.unwrap();
        assert_eq!(r1.segment_id, r2.segment_id);
        assert!(r2.offset > r1.offset);
    }

    #[tokio::test]
    async fn rotation_happens_when_segment_would_exceed_max_bytes() {
        let dir = tempdir().unwrap();
        let max_bytes = SEGMENT_HEADER_LEN + RECORD_HEADER_LEN + 16;
        let mgr = SegmentManager::new(dir.path().to_path_buf(), max_bytes, Duration::from_secs(600));
        let (h1, d1) = chunk(1, 16);
        let (h2, d2) = chunk(2, 16);
        let r1 = mgr.append_chunk(&h1, &d1).await.unwrap();
        let r2 = mgr.append_chunk(&h2, &d2).await.unwrap();
        assert_ne!(r1.segment_id, r2.segment_id);
        // the first segment must have been sealed with a footer
        let sealed_path = dir.path().join(&r1.segment_id);
        let bytes = std::fs::read(sealed_path).unwrap();
        assert!(bytes.len() as u64 >= FOOTER_LEN);
    }

    #[tokio::test]
    async fn sync_is_a_noop_with_no_active_segment() {
        let dir = tempdir().unwrap();
        let mgr = SegmentManager::new(dir.path().to_path_buf(), 1024, Duration::from_secs(600));
        mgr.sync().await.unwrap();
    }

    #[tokio::test]
    async fn seal_current_finalizes_and_clears_active_segment() {
        let dir = tempdir().unwrap();
        let mgr = SegmentManager::new(dir.path().to_path_buf(), 1024 * 1024, Duration::from_secs(600));
        let (hash, data) = chunk(1, 16);
        mgr.append_chunk(&hash, &data).await.unwrap();
        let sealed = mgr.seal_current().await.unwrap();
        assert!(sealed.is_some());
        assert!(mgr.seal_current().await.unwrap().is_none());
    }

    #[test]
    fn recover_promotes_clean_open_segment_to_sealed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-s1");
        let mut bytes = SegmentHeader::new().encode().to_vec();
        let data = b"abc";
        let hash = *blake3::hash(data).as_bytes();
        bytes.extend(format::encode_record(&hash, data).unwrap());
        std::fs::write(&path, &bytes).unwrap();

        let outcome = recover_segment_file(&path).unwrap();
        match outcome {
            RecoveryOutcome::PromotedToSealed { .. } => {}
            other => panic!("expected PromotedToSealed, got {other:?}"),
        }
        let final_bytes = std::fs::read(&path).unwrap();
        assert!(Footer::decode(&final_bytes[final_bytes.len() - FOOTER_LEN as usize..]).is_ok());
    }

    #[test]
    fn recover_leaves_truncated_record_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-s2");
        let mut bytes = SegmentHeader::new().encode().to_vec();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(blake3::hash(b"0123456789").as_bytes());
        bytes.extend_from_slice(&hash);
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(b"12345"); // only 5 of the claimed 10 bytes
        std::fs::write(&path, &bytes).unwrap();

        let outcome = recover_segment_file(&path).unwrap();
        assert_eq!(outcome, RecoveryOutcome::StillOpen);
    }

    #[test]
    fn recover_recognizes_an_already_sealed_segment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-sealed");
        let mut bytes = SegmentHeader::new().encode().to_vec();
        let data = b"xyz";
        let hash = *blake3::hash(data).as_bytes();
        bytes.extend(format::encode_record(&hash, data).unwrap());
        let mut footer = Footer::new(0, 0, 0, 0);
        footer.finalize();
        bytes.extend_from_slice(&footer.encode());
        std::fs::write(&path, &bytes).unwrap();

        let outcome = recover_segment_file(&path).unwrap();
        assert_eq!(outcome, RecoveryOutcome::AlreadySealed);
    }

    #[tokio::test]
    async fn seal_writes_a_bloom_and_index_covering_every_appended_chunk() {
        let dir = tempdir().unwrap();
        let mgr = SegmentManager::new(dir.path().to_path_buf(), 1024 * 1024, Duration::from_secs(600));
        let (h1, d1) = chunk(1, 16);
        let (h2, d2) = chunk(2, 16);
        mgr.append_chunk(&h1, &d1).await.unwrap();
        let r2 = mgr.append_chunk(&h2, &d2).await.unwrap();
        let sealed = mgr.seal_current().await.unwrap().unwrap();

        let path = dir.path().join(&sealed.segment_id);
        let bytes = std::fs::read(&path).unwrap();
        let footer = Footer::decode(&bytes[bytes.len() - FOOTER_LEN as usize..]).unwrap();
        assert!(footer.has_bloom());
        assert!(footer.has_index());

        let bloom_bytes = &bytes[footer.bloom_off as usize..(footer.bloom_off + footer.bloom_len) as usize];
        let bloom = BloomFilter::decode(bloom_bytes).unwrap();
        assert!(bloom.might_contain(&h1));
        assert!(bloom.might_contain(&h2));

        let index_bytes = &bytes[footer.index_off as usize..(footer.index_off + footer.index_len) as usize];
        let index = Index::decode(index_bytes).unwrap();
        assert_eq!(index.find(&h2), Some(r2.offset));
    }

    #[test]
    fn recover_promotes_with_bloom_and_index_over_its_scanned_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg-s3");
        let mut bytes = SegmentHeader::new().encode().to_vec();
        let data = b"abc";
        let hash = *blake3::hash(data).as_bytes();
        bytes.extend(format::encode_record(&hash, data).unwrap());
        std::fs::write(&path, &bytes).unwrap();

        recover_segment_file(&path).unwrap();
        let final_bytes = std::fs::read(&path).unwrap();
        let footer = Footer::decode(&final_bytes[final_bytes.len() - FOOTER_LEN as usize..]).unwrap();
        assert!(footer.has_bloom());
        assert!(footer.has_index());
        let bloom_bytes = &final_bytes[footer.bloom_off as usize..(footer.bloom_off + footer.bloom_len) as usize];
        let bloom = BloomFilter::decode(bloom_bytes).unwrap();
        assert!(bloom.might_contain(&hash));
    }

    #[test]
    fn segment_state_parse_roundtrip() {
        assert_eq!(SegmentState::parse("OPEN").unwrap(), SegmentState::Open);
        assert_eq!(SegmentState::parse("SEALED").unwrap(), SegmentState::Sealed);
        assert!(SegmentState::parse("WAT").is_err());
    }
}
