//! zsync control-file model: header fields plus the per-block checksum table

pub mod make;
pub mod parse;

pub use make::{build_control, MakeOptions};
pub use parse::parse_control;

use crate::checksum::{Rsum, WeakMask};
use std::time::SystemTime;

/// Protocol version this client implements
pub const CLIENT_VERSION: &str = "0.6.2";

/// Control files produced by this zsyncmake release are broken and are
/// rejected outright.
pub const REJECTED_MAKE_VERSION: &str = "0.0.4";

/// Weak and strong checksum of one target block.
///
/// `strong` holds the truncated MD4; only the first
/// `SessionParams::checksum_bytes` bytes are significant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMeta {
    pub weak: Rsum,
    pub strong: [u8; 16],
}

/// Everything the header of a control file describes about the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Exact length of the target file
    pub filelen: u64,
    /// Block size, a power of two
    pub block_size: usize,
    /// `log2(block_size)`
    pub block_shift: u32,
    /// `ceil(filelen / block_size)`
    pub block_count: u32,
    /// Consecutive weak hits required before a strong check (1 or 2)
    pub seq_matches: usize,
    /// Significant bytes of each weak sum on the wire
    pub rsum_bytes: usize,
    /// Significant bytes of each strong sum
    pub checksum_bytes: usize,
    /// Download URLs for the target, absolute or relative to the control
    /// file's final location
    pub urls: Vec<String>,
    /// Whole-file SHA-1, the integrity gate when present
    pub sha1: Option<[u8; 20]>,
    /// Target modification time from the `MTime` header
    pub mtime: Option<SystemTime>,
    /// Suggested output filename
    pub filename: Option<String>,
}

impl SessionParams {
    /// Matching window in bytes: `block_size * seq_matches`
    pub fn context(&self) -> usize {
        self.block_size * self.seq_matches
    }

    /// Wire mask for weak-sum comparison
    pub fn weak_mask(&self) -> WeakMask {
        WeakMask::for_rsum_bytes(self.rsum_bytes)
    }

    /// Bytes per record in the checksum table
    pub fn record_len(&self) -> usize {
        self.rsum_bytes + self.checksum_bytes
    }
}

/// Parsed control file: header parameters plus one `BlockMeta` per block
#[derive(Debug, Clone)]
pub struct ControlFile {
    pub params: SessionParams,
    pub blocks: Vec<BlockMeta>,
}
