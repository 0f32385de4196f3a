//! Fixed-size chunker.
//!
//! Splits an input byte stream into chunks of at most `chunk_size` bytes,
//! hashing each with BLAKE3. The sequence is finite and non-restartable,
//! driven entirely by `Read::read`, so memory use is independent of the
//! object size being chunked.

use crate::error::Result;
use std::io::Read;

/// One chunk produced by the chunker: its position in the object,
/// its content hash, and the raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub hash: [u8; 32],
    pub data: Vec<u8>,
}

/// Fixed-size splitter over a `Read` source.
pub struct Chunker<R: Read> {
    input: R,
    chunk_size: usize,
    next_index: u32,
    done: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(input: R, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        Self {
            input,
            chunk_size,
            next_index: 0,
            done: false,
        }
    }

    /// Pull the next chunk, or `None` once the input is exhausted.
    /// Empty input yields zero chunks.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.input.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.done = true;
            return Ok(None);
        }

        buf.truncate(filled);
        if filled < self.chunk_size {
            // short read: this is the final chunk
            self.done = true;
        }

        let hash = *blake3::hash(&buf).as_bytes();
        let index = self.next_index;
        self.next_index += 1;

        Ok(Some(Chunk {
            index,
            hash,
            data: buf,
        }))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(c)) => Some(Ok(c)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
