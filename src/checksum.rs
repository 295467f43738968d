//! Weak rolling checksums and strong block digests
//!
//! The weak sum is the Adler-style `(a, b)` pair rsync uses, 16 bits each,
//! updated in O(1) as the window slides. The strong sum is MD4 truncated to
//! the control file's `checksum_bytes`; MD4 is kept for wire compatibility
//! with zsync, the whole-file SHA-1 is the integrity gate.

use md4::{Digest, Md4};

/// Adler-style rolling checksum over one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rsum {
    pub a: u16,
    pub b: u16,
}

impl Rsum {
    /// Compute the sum of a full window.
    ///
    /// `data` shorter than `block_size` is treated as zero-padded at the
    /// end, matching how the last block of a target is checksummed.
    pub fn of_block(data: &[u8], block_size: usize) -> Self {
        let mut a: u16 = 0;
        let mut b: u16 = 0;
        for (i, &byte) in data.iter().enumerate() {
            a = a.wrapping_add(byte as u16);
            b = b.wrapping_add(((block_size - i) as u16).wrapping_mul(byte as u16));
        }
        Rsum { a, b }
    }

    /// Slide the window one byte: `old` leaves at the front, `new` enters
    /// at the back. `b` uses the already-updated `a`, which is the
    /// canonical rsync update order.
    #[inline]
    pub fn roll(&mut self, old: u8, new: u8, block_shift: u32) {
        self.a = self.a.wrapping_add(new as u16).wrapping_sub(old as u16);
        // The shift is mod 2^16 arithmetic; widen so block sizes >= 64 KiB
        // shift to zero instead of overflowing.
        self.b = self
            .b
            .wrapping_add(self.a)
            .wrapping_sub(((old as u64) << block_shift) as u16);
    }

    /// Mask down to the bits the wire format actually carries
    #[inline]
    pub fn masked(self, mask: WeakMask) -> Rsum {
        Rsum {
            a: self.a & mask.a,
            b: self.b & mask.b,
        }
    }

    /// Append the low `rsum_bytes` bytes of the big-endian `(a, b)` pair
    pub fn to_wire(self, rsum_bytes: usize, out: &mut Vec<u8>) {
        let full = [
            (self.a >> 8) as u8,
            self.a as u8,
            (self.b >> 8) as u8,
            self.b as u8,
        ];
        out.extend_from_slice(&full[4 - rsum_bytes..]);
    }

    /// Decode from the low `bytes.len()` wire bytes; the missing
    /// high-order bytes are zero.
    pub fn from_wire(bytes: &[u8]) -> Rsum {
        debug_assert!((1..=4).contains(&bytes.len()));
        let mut full = [0u8; 4];
        full[4 - bytes.len()..].copy_from_slice(bytes);
        Rsum {
            a: u16::from_be_bytes([full[0], full[1]]),
            b: u16::from_be_bytes([full[2], full[3]]),
        }
    }
}

/// Significant bits of a weak sum for a given `rsum_bytes`.
///
/// Wire order is `(a_hi, a_lo, b_hi, b_lo)` truncated from the front, so
/// one byte keeps only `b`'s low half, two keep all of `b`, three add
/// `a`'s low half, four keep everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakMask {
    pub a: u16,
    pub b: u16,
}

impl WeakMask {
    pub fn for_rsum_bytes(rsum_bytes: usize) -> Self {
        let a = match rsum_bytes {
            1 | 2 => 0x0000,
            3 => 0x00ff,
            _ => 0xffff,
        };
        let b = if rsum_bytes == 1 { 0x00ff } else { 0xffff };
        WeakMask { a, b }
    }
}

/// MD4 digest of one full (zero-padded) block
pub fn md4_block(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(data);
    hasher.finalize().into()
}
