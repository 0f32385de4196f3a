//! Segment index blob: a dense table mapping each chunk's content hash
//! to its byte offset within the segment, so a lookup avoids scanning
//! every record.

use crate::error::{Result, SeglakeError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: i64,
    pub hash: [u8; 32],
}

const ENTRY_LEN: usize = 8 + 32;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    pub entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: i64, hash: [u8; 32]) {
        self.entries.push(IndexEntry { offset, hash });
    }

    pub fn find(&self, hash: &[u8; 32]) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| &e.hash == hash)
            .map(|e| e.offset)
    }

    /// `count:u32 ‖ entries[count]{offset:i64, hash[32]}`.
    pub fn encode(&self) -> Vec<u8> {
        let count: u32 = self.entries.len() as u32;
        let mut out = Vec::with_capacity(4 + self.entries.len() * ENTRY_LEN);
        out.extend_from_slice(&count.to_le_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.offset.to_le_bytes());
            out.extend_from_slice(&e.hash);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(SeglakeError::integrity("index blob truncated"));
        }
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let expected_len = 4 + count * ENTRY_LEN;
        if bytes.len() != expected_len {
            return Err(SeglakeError::integrity("index blob size mismatch"));
        }
        let mut entries = Vec::with_capacity(count);
        let mut pos = 4;
        for _ in 0..count {
            let offset = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes[pos + 8..pos + 40]);
            entries.push(IndexEntry { offset, hash });
            pos += ENTRY_LEN;
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(n: u8) -> [u8; 32] {
        *blake3::hash(&[n]).as_bytes()
    }

    #[test]
    fn empty_index_roundtrip() {
        let idx = Index::new();
        let encoded = idx.encode();
        assert_eq!(encoded.len(), 4);
        let decoded = Index::decode(&encoded).unwrap();
        assert_eq!(idx, decoded);
    }

    #[test]
    fn populated_index_roundtrip() {
        let mut idx = Index::new();
        idx.push(8, hash_of(1));
        idx.push(100, hash_of(2));
        idx.push(4096, hash_of(3));
        let encoded = idx.encode();
        let decoded = Index::decode(&encoded).unwrap();
        assert_eq!(idx, decoded);
    }

    #[test]
    fn find_locates_offset_by_hash() {
        let mut idx = Index::new();
        idx.push(8, hash_of(1));
        idx.push(100, hash_of(2));
        assert_eq!(idx.find(&hash_of(2)), Some(100));
        assert_eq!(idx.find(&hash_of(9)), None);
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let mut idx = Index::new();
        idx.push(8, hash_of(1));
        let mut encoded = idx.encode();
        encoded.pop();
        assert!(Index::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_truncated_count() {
        assert!(Index::decode(&[0u8; 2]).is_err());
    }

    #[test]
    fn decode_rejects_oversized_count_claim() {
        // count says 5 entries but only bytes for 0 follow
        let mut bytes = 5u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(Index::decode(&bytes).is_err());
    }
}
