//! Binary layout for segment files.
//!
//! ```text
//! SegmentHeader{magic,version} ‖ chunk records ‖ [bloom blob] ‖ [index blob] ‖ Footer
//! ```
//!
//! A record is `{blake3(data)[32] ‖ len:u32 ‖ data[len]}`. All multi-byte
//! integers are little-endian so the footer checksum is stable regardless
//! of host endianness.

use crate::error::{Result, SeglakeError};

pub const SEGMENT_HEADER_MAGIC: u32 = 0x53474C53; // "SGLS"
pub const SEGMENT_FOOTER_MAGIC: u32 = 0x53474C4B; // "SGLK"
pub const FORMAT_VERSION: u32 = 1;

pub const SEGMENT_HEADER_LEN: u64 = 8;
pub const RECORD_HEADER_LEN: u64 = 36; // 32-byte hash + 4-byte len
pub const FOOTER_LEN: u64 = 4 + 4 + 8 + 8 + 8 + 8 + 32; // = 72

/// `SegmentHeader{magic,version}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
}

impl SegmentHeader {
    pub fn new() -> Self {
        Self {
            magic: SEGMENT_HEADER_MAGIC,
            version: FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN as usize] {
        let mut out = [0u8; SEGMENT_HEADER_LEN as usize];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_LEN as usize {
            return Err(SeglakeError::integrity("segment header truncated"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if magic != SEGMENT_HEADER_MAGIC {
            return Err(SeglakeError::integrity("bad segment header magic"));
        }
        if version != FORMAT_VERSION {
            return Err(SeglakeError::integrity("unsupported segment version"));
        }
        Ok(Self { magic, version })
    }
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one chunk record: `hash[32] ‖ len:u32 ‖ data`.
pub fn encode_record(hash: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(SeglakeError::invalid_argument(
            "record data must be non-empty (len == 0 is rejected)",
        ));
    }
    let len: u32 = data
        .len()
        .try_into()
        .map_err(|_| SeglakeError::invalid_argument("record too large"))?;
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN as usize + data.len());
    out.extend_from_slice(hash);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Validate a decoded record header length field: `len == 0` is rejected.
pub fn validate_record_len(len: u32) -> Result<()> {
    if len == 0 {
        return Err(SeglakeError::integrity("record len must be >= 1"));
    }
    Ok(())
}

/// Parse a record header (hash, len) from exactly `RECORD_HEADER_LEN`
/// bytes. Does not read or validate the payload.
pub fn decode_record_header(bytes: &[u8]) -> Result<([u8; 32], u32)> {
    if bytes.len() < RECORD_HEADER_LEN as usize {
        return Err(SeglakeError::integrity("record header truncated"));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[0..32]);
    let len = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
    validate_record_len(len)?;
    Ok((hash, len))
}

/// `Footer{magic, version, bloom_off, index_off, bloom_len, index_len, checksum}`.
/// `bloom_off`/`index_off`/`bloom_len`/`index_len` are `0` when the
/// corresponding region is absent (offset `0` is never a valid payload
/// offset since the header always occupies the first `SEGMENT_HEADER_LEN`
/// bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    pub magic: u32,
    pub version: u32,
    pub bloom_off: i64,
    pub bloom_len: i64,
    pub index_off: i64,
    pub index_len: i64,
    pub checksum: [u8; 32],
}

impl Footer {
    pub fn new(bloom_off: i64, bloom_len: i64, index_off: i64, index_len: i64) -> Self {
        Self {
            magic: SEGMENT_FOOTER_MAGIC,
            version: FORMAT_VERSION,
            bloom_off,
            bloom_len,
            index_off,
            index_len,
            checksum: [0u8; 32],
        }
    }

    pub fn has_bloom(&self) -> bool {
        self.bloom_off != 0
    }

    pub fn has_index(&self) -> bool {
        self.index_off != 0
    }

    /// The offset at which chunk-record data ends (start of bloom, or
    /// index, or footer, whichever is first).
    pub fn data_end(&self, segment_size: u64) -> u64 {
        if self.has_bloom() {
            self.bloom_off as u64
        } else if self.has_index() {
            self.index_off as u64
        } else {
            segment_size.saturating_sub(FOOTER_LEN)
        }
    }

    fn encode_with_checksum(&self, checksum: &[u8; 32]) -> [u8; FOOTER_LEN as usize] {
        let mut out = [0u8; FOOTER_LEN as usize];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.bloom_off.to_le_bytes());
        out[16..24].copy_from_slice(&self.index_off.to_le_bytes());
        out[24..32].copy_from_slice(&self.bloom_len.to_le_bytes());
        out[32..40].copy_from_slice(&self.index_len.to_le_bytes());
        out[40..72].copy_from_slice(checksum);
        out
    }

    /// Compute and store the checksum: `blake3(footer with checksum
    /// field zeroed)`. Idempotent — calling it twice yields the same
    /// bytes.
    pub fn finalize(&mut self) {
        let zeroed = self.encode_with_checksum(&[0u8; 32]);
        self.checksum = *blake3::hash(&zeroed).as_bytes();
    }

    pub fn encode(&self) -> [u8; FOOTER_LEN as usize] {
        self.encode_with_checksum(&self.checksum)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FOOTER_LEN as usize {
            return Err(SeglakeError::integrity("footer truncated"));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if magic != SEGMENT_FOOTER_MAGIC {
            return Err(SeglakeError::integrity("bad footer magic"));
        }
        if version != FORMAT_VERSION {
            return Err(SeglakeError::integrity("unsupported footer version"));
        }
        let bloom_off = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let index_off = i64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let bloom_len = i64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let index_len = i64::from_le_bytes(bytes[32..40].try_into().unwrap());
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[40..72]);

        let footer = Footer {
            magic,
            version,
            bloom_off,
            bloom_len,
            index_off,
            index_len,
            checksum,
        };
        footer.validate()?;
        Ok(footer)
    }

    /// Recompute the checksum over this footer's own fields (with the
    /// checksum zeroed) and compare to `self.checksum`.
    pub fn validate(&self) -> Result<()> {
        let zeroed = self.encode_with_checksum(&[0u8; 32]);
        let expected = *blake3::hash(&zeroed).as_bytes();
        if expected != self.checksum {
            return Err(SeglakeError::integrity("footer checksum mismatch"));
        }
        Ok(())
    }
}
