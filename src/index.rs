//! Two-level weak-hash index over the block checksum table
//!
//! A coarse bit filter answers most negative probes in O(1); survivors walk
//! a chained bucket of block IDs sharing the weak hash. The `BlockMeta`
//! vector is stationary; chains are parallel index vectors, not pointers.

use crate::checksum::{Rsum, WeakMask};
use crate::control::{BlockMeta, SessionParams};

/// Bits the bit filter adds below the bucket hash
const BIT_HASH_BITS: u32 = 3;

/// Index of per-block checksums keyed by weak hash.
///
/// Blocks are removed as they become known; a removed block never
/// reappears, even across a rebuild.
#[derive(Debug)]
pub struct ChecksumIndex {
    meta: Vec<BlockMeta>,
    seq_matches: usize,
    checksum_bytes: usize,
    mask: WeakMask,
    /// Blocks taken out of matching (already present in the scratch file)
    removed: Vec<bool>,
    built: bool,
    hash_mask: u32,
    bit_mask: u32,
    /// Head of each bucket's chain, ascending block ID within a chain
    buckets: Vec<Option<u32>>,
    /// Chain successor per block ID
    next: Vec<Option<u32>>,
    /// Coarse filter, one bit per `bit_mask`-masked hash
    bits: Vec<u8>,
}

impl ChecksumIndex {
    pub fn new(params: &SessionParams, blocks: Vec<BlockMeta>) -> Self {
        let n = blocks.len();
        Self {
            meta: blocks,
            seq_matches: params.seq_matches,
            checksum_bytes: params.checksum_bytes,
            mask: params.weak_mask(),
            removed: vec![false; n],
            built: false,
            hash_mask: 0,
            bit_mask: 0,
            buckets: Vec::new(),
            next: vec![None; n],
            bits: Vec::new(),
        }
    }

    pub fn block_count(&self) -> u32 {
        self.meta.len() as u32
    }

    pub fn meta(&self, bid: u32) -> &BlockMeta {
        &self.meta[bid as usize]
    }

    /// Whether `bid` still participates in matching
    pub fn is_active(&self, bid: u32) -> bool {
        !self.removed[bid as usize]
    }

    /// Replace one block's checksums; any existing index is wiped and
    /// rebuilt on the next lookup.
    pub fn set_block(&mut self, bid: u32, meta: BlockMeta) {
        self.meta[bid as usize] = meta;
        if self.built {
            self.built = false;
            self.buckets.clear();
            self.bits.clear();
            self.next.iter_mut().for_each(|n| *n = None);
        }
    }

    /// Weak hash of the rolling window's current sum pair
    fn hash_pair(&self, cur: Rsum, next: Rsum) -> u32 {
        let cur = cur.masked(self.mask);
        let high = if self.seq_matches > 1 {
            (next.b & self.mask.b) as u32
        } else {
            cur.a as u32
        };
        cur.b as u32 ^ (high << BIT_HASH_BITS)
    }

    /// Weak hash of a stored block, pairing it with its successor's sum
    /// when two sequential matches are required
    fn hash_of_block(&self, bid: u32) -> u32 {
        let next = self
            .meta
            .get(bid as usize + 1)
            .map(|m| m.weak)
            .unwrap_or_default();
        self.hash_pair(self.meta[bid as usize].weak, next)
    }

    fn bit_test(&self, hash: u32) -> bool {
        let h = hash & self.bit_mask;
        self.bits[(h >> 3) as usize] & (1 << (h & 7)) != 0
    }

    fn bit_set(&mut self, hash: u32) {
        let h = hash & self.bit_mask;
        self.bits[(h >> 3) as usize] |= 1 << (h & 7);
    }

    /// Build the bucket table. Sized to the smallest power of two that
    /// still spreads `block_count` entries; iterating the block table in
    /// reverse while prepending leaves each chain in ascending ID order.
    fn build(&mut self) {
        let n = self.meta.len() as u64;
        let mut k: u32 = 16;
        while (2u64 << (k - 1)) > n && k > 4 {
            k -= 1;
        }
        self.hash_mask = (2u32 << k) - 1;
        self.bit_mask = (2u32 << (k + BIT_HASH_BITS)) - 1;

        self.buckets = vec![None; self.hash_mask as usize + 1];
        self.bits = vec![0u8; (self.bit_mask as usize + 1).div_ceil(8)];
        self.next.iter_mut().for_each(|n| *n = None);

        for bid in (0..self.meta.len() as u32).rev() {
            if self.removed[bid as usize] {
                continue;
            }
            let h = self.hash_of_block(bid);
            self.bit_set(h);
            let slot = (h & self.hash_mask) as usize;
            self.next[bid as usize] = self.buckets[slot];
            self.buckets[slot] = Some(bid);
        }
        self.built = true;

        tracing::debug!(
            buckets = self.buckets.len(),
            blocks = self.meta.len(),
            "built weak-hash index"
        );
    }

    /// Head of the candidate chain for the window's sum pair, or `None`
    /// when the bit filter rules the probe out. Builds lazily.
    pub fn lookup(&mut self, cur: Rsum, next: Rsum) -> Option<u32> {
        if !self.built {
            self.build();
        }
        let h = self.hash_pair(cur, next);
        if !self.bit_test(h) {
            return None;
        }
        self.buckets[(h & self.hash_mask) as usize]
    }

    /// Chain successor of `bid`. Stale links from removed blocks still
    /// lead back into the live chain, so an in-flight walk survives
    /// removals.
    pub fn chain_next(&self, bid: u32) -> Option<u32> {
        self.next[bid as usize]
    }

    /// Take `bid` out of matching, unlinking it from its chain. The bit
    /// filter is left set (false positives are allowed).
    pub fn remove(&mut self, bid: u32) {
        if self.removed[bid as usize] {
            return;
        }
        self.removed[bid as usize] = true;
        if !self.built {
            return;
        }

        let slot = (self.hash_of_block(bid) & self.hash_mask) as usize;
        let mut cur = self.buckets[slot];
        if cur == Some(bid) {
            self.buckets[slot] = self.next[bid as usize];
            return;
        }
        while let Some(c) = cur {
            if self.next[c as usize] == Some(bid) {
                self.next[c as usize] = self.next[bid as usize];
                return;
            }
            cur = self.next[c as usize];
        }
    }

    /// Masked weak-sum comparison against a stored block
    pub fn weak_matches(&self, bid: u32, sum: Rsum) -> bool {
        self.meta[bid as usize].weak == sum.masked(self.mask)
    }

    /// Truncated strong-sum comparison against a stored block
    pub fn strong_matches(&self, bid: u32, digest: &[u8; 16]) -> bool {
        self.meta[bid as usize].strong[..self.checksum_bytes] == digest[..self.checksum_bytes]
    }
}
