pub mod bloom;
pub mod format;
pub mod index;
pub mod manager;

pub use bloom::BloomFilter;
pub use format::{Footer, SegmentHeader, FOOTER_LEN, SEGMENT_HEADER_LEN};
pub use index::Index;
pub use manager::{AppendResult, SegmentManager, SegmentState};
