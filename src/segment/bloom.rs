//! Per-segment bloom filter over chunk hashes.
//!
//! Sized for a 1% false-positive rate; membership uses double hashing
//! over two 64-bit halves of each BLAKE3 chunk hash:
//! `bit = (h1 + i*h2) mod m`, for `i` in `0..k`.

use crate::error::{Result, SeglakeError};

const TARGET_FALSE_POSITIVE_RATE: f64 = 0.01;
const MIN_K: u32 = 1;
const MAX_K: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: u64,
    k: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the target false-positive
    /// rate, with `k` clamped to `[1, 8]`.
    pub fn new_for_count(expected_items: usize) -> Self {
        let n = expected_items.max(1) as f64;
        let m = (-(n * TARGET_FALSE_POSITIVE_RATE.ln()) / (std::f64::consts::LN_2.powi(2))).ceil();
        let bit_count = (m as u64).max(8);
        let k_raw = ((bit_count as f64 / n) * std::f64::consts::LN_2).round() as u32;
        let k = k_raw.clamp(MIN_K, MAX_K);
        let byte_count = bit_count.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_count],
            bit_count,
            k,
        }
    }

    fn halves(hash: &[u8; 32]) -> (u64, u64) {
        let h1 = u64::from_le_bytes(hash[0..8].try_into().unwrap());
        let h2 = u64::from_le_bytes(hash[8..16].try_into().unwrap());
        (h1, h2)
    }

    fn bit_positions(&self, hash: &[u8; 32]) -> impl Iterator<Item = u64> + '_ {
        let (h1, h2) = Self::halves(hash);
        (0..self.k as u64).map(move |i| {
            let combined = h1.wrapping_add(i.wrapping_mul(h2));
            combined % self.bit_count
        })
    }

    pub fn insert(&mut self, hash: &[u8; 32]) {
        let positions: Vec<u64> = self.bit_positions(hash).collect();
        for bit in positions {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            self.bits[byte] |= mask;
        }
    }

    pub fn might_contain(&self, hash: &[u8; 32]) -> bool {
        self.bit_positions(hash).all(|bit| {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            self.bits[byte] & mask != 0
        })
    }

    /// `bit_count:u64 ‖ k:u32 ‖ bits[..]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.bits.len());
        out.extend_from_slice(&self.bit_count.to_le_bytes());
        out.extend_from_slice(&self.k.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(SeglakeError::integrity("bloom blob truncated"));
        }
        let bit_count = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let k = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let expected_bytes = bit_count.div_ceil(8) as usize;
        let actual_bytes = bytes.len() - 12;
        if actual_bytes != expected_bytes {
            return Err(SeglakeError::integrity("bloom blob size mismatch"));
        }
        if !(MIN_K..=MAX_K).contains(&k) {
            return Err(SeglakeError::integrity("bloom k out of range"));
        }
        Ok(Self {
            bits: bytes[12..].to_vec(),
            bit_count,
            k,
        })
    }
}
