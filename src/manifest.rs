//! Binary manifest codec: the ordered list of chunk references that
//! composes one object version.
//!
//! Layout: `magic:u32 ‖ version:u32 ‖ versionID{len:u32,bytes} ‖
//! size:i64 ‖ count:u32 ‖ chunks[count]{index:u32, hash[32],
//! segmentID{len:u32,bytes}, offset:i64, len:u32} ‖
//! blake3-256(body after the magic/version header)`. `bucket` and `key`
//! are not part of the encoded body — they live in the manifest's
//! filename so the filesystem stays authoritative if the SQL index is
//! lost.

use crate::error::{Result, SeglakeError};

pub const MANIFEST_MAGIC: u32 = 0x53474C4D; // "SGLM"
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    pub index: u32,
    pub hash: [u8; 32],
    pub segment_id: String,
    pub offset: i64,
    pub len: u32,
}

/// An immutable, versioned object manifest. `bucket`/`key` are carried
/// in memory for convenience but are not part of the encoded bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub size: i64,
    pub chunks: Vec<ChunkRef>,
}

impl Manifest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: version_id.into(),
            size: 0,
            chunks: Vec::new(),
        }
    }

    /// `sum(chunks[i].len) == size` — checked here on construction, not
    /// re-derived on every access.
    pub fn from_chunks(
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: impl Into<String>,
        chunks: Vec<ChunkRef>,
    ) -> Self {
        let size: i64 = chunks.iter().map(|c| c.len as i64).sum();
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id: version_id.into(),
            size,
            chunks,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_lp_string(&mut body, &self.version_id);
        body.extend_from_slice(&self.size.to_le_bytes());
        body.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for c in &self.chunks {
            body.extend_from_slice(&c.index.to_le_bytes());
            body.extend_from_slice(&c.hash);
            write_lp_string(&mut body, &c.segment_id);
            body.extend_from_slice(&c.offset.to_le_bytes());
            body.extend_from_slice(&c.len.to_le_bytes());
        }
        body
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let checksum = *blake3::hash(&body).as_bytes();
        let mut out = Vec::with_capacity(8 + body.len() + 32);
        out.extend_from_slice(&MANIFEST_MAGIC.to_le_bytes());
        out.extend_from_slice(&MANIFEST_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum);
        out
    }

    /// Decode a manifest body. The caller supplies `bucket`/`key`
    /// (normally parsed from the manifest's filename) since the wire
    /// format itself carries neither.
    pub fn decode(bytes: &[u8], bucket: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(SeglakeError::integrity("manifest truncated: no header"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MANIFEST_MAGIC {
            return Err(SeglakeError::integrity("manifest bad magic"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != MANIFEST_FORMAT_VERSION {
            return Err(SeglakeError::integrity("manifest unsupported version"));
        }
        if bytes.len() < 40 {
            return Err(SeglakeError::integrity("manifest truncated: no checksum"));
        }
        let (body, checksum_bytes) = bytes[8..].split_at(bytes.len() - 8 - 32);
        let expected = *blake3::hash(body).as_bytes();
        if expected != checksum_bytes {
            return Err(SeglakeError::integrity("manifest checksum mismatch"));
        }

        let mut cur = std::io::Cursor::new(body);
        let version_id = read_lp_string(&mut cur)?;
        let size = read_i64(&mut cur)?;
        let count = read_u32(&mut cur)?;
        let mut chunks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = read_u32(&mut cur)?;
            let hash = read_hash(&mut cur)?;
            let segment_id = read_lp_string(&mut cur)?;
            let offset = read_i64(&mut cur)?;
            let len = read_u32(&mut cur)?;
            chunks.push(ChunkRef {
                index,
                hash,
                segment_id,
                offset,
                len,
            });
        }

        let pos = cur.position() as usize;
        if pos != body.len() {
            return Err(SeglakeError::integrity("manifest has trailing bytes"));
        }

        Ok(Self {
            bucket: bucket.into(),
            key: key.into(),
            version_id,
            size,
            chunks,
        })
    }
}

fn write_lp_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(cur: &mut std::io::Cursor<&[u8]>) -> Result<u32> {
    let pos = cur.position() as usize;
    let buf = cur.get_ref();
    if buf.len() < pos + 4 {
        return Err(SeglakeError::integrity("manifest truncated: u32 field"));
    }
    let v = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
    cur.set_position((pos + 4) as u64);
    Ok(v)
}

fn read_i64(cur: &mut std::io::Cursor<&[u8]>) -> Result<i64> {
    let pos = cur.position() as usize;
    let buf = cur.get_ref();
    if buf.len() < pos + 8 {
        return Err(SeglakeError::integrity("manifest truncated: i64 field"));
    }
    let v = i64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
    cur.set_position((pos + 8) as u64);
    Ok(v)
}

fn read_hash(cur: &mut std::io::Cursor<&[u8]>) -> Result<[u8; 32]> {
    let pos = cur.position() as usize;
    let buf = cur.get_ref();
    if buf.len() < pos + 32 {
        return Err(SeglakeError::integrity("manifest truncated: hash field"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&buf[pos..pos + 32]);
    cur.set_position((pos + 32) as u64);
    Ok(hash)
}

fn read_lp_string(cur: &mut std::io::Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(cur)? as usize;
    let pos = cur.position() as usize;
    let buf = cur.get_ref();
    if buf.len() < pos + len {
        return Err(SeglakeError::integrity("manifest truncated: string field"));
    }
    let s = String::from_utf8(buf[pos..pos + len].to_vec())
        .map_err(|_| SeglakeError::integrity("manifest string field is not utf-8"))?;
    cur.set_position((pos + len) as u64);
    Ok(s)
}
