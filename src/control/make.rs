//! Control-file generation, the counterpart of the parser.
//!
//! Mirrors what zsyncmake emits for an uncompressed target: header, blank
//! line, then the packed weak/strong table. Used by the test suite to
//! fabricate targets and exposed for callers that publish their own files.

use super::CLIENT_VERSION;
use crate::checksum::{md4_block, Rsum};
use crate::error::{Error, Result};
use sha1::{Digest, Sha1};
use std::time::SystemTime;

/// Options for [`build_control`]; unset fields are chosen from the data
#[derive(Debug, Clone, Default)]
pub struct MakeOptions {
    /// Block size override; must be a power of two
    pub block_size: Option<usize>,
    /// Value for the `Filename` header
    pub filename: Option<String>,
    /// Values for `URL` headers
    pub urls: Vec<String>,
    /// Value for the `MTime` header
    pub mtime: Option<SystemTime>,
}

/// Serialize a complete control file describing `data`.
pub fn build_control(data: &[u8], opts: &MakeOptions) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(Error::control("cannot describe an empty target"));
    }

    let len = data.len() as u64;
    let block_size = match opts.block_size {
        Some(bs) if bs > 0 && bs.is_power_of_two() => bs,
        Some(bs) => {
            return Err(Error::control(format!(
                "block size must be a positive power of two, got {}",
                bs
            )))
        }
        None => {
            if len < 100 * 1024 * 1024 {
                2048
            } else {
                4096
            }
        }
    };
    let (seq_matches, rsum_bytes, checksum_bytes) = hash_lengths(len, block_size);

    let mut header = String::new();
    header.push_str(&format!("zsync: {}\n", CLIENT_VERSION));
    if let Some(name) = &opts.filename {
        header.push_str(&format!("Filename: {}\n", name));
    }
    if let Some(mtime) = opts.mtime {
        header.push_str(&format!("MTime: {}\n", httpdate::fmt_http_date(mtime)));
    }
    header.push_str(&format!("Blocksize: {}\n", block_size));
    header.push_str(&format!("Length: {}\n", len));
    header.push_str(&format!(
        "Hash-Lengths: {},{},{}\n",
        seq_matches, rsum_bytes, checksum_bytes
    ));
    for url in &opts.urls {
        header.push_str(&format!("URL: {}\n", url));
    }
    header.push_str(&format!("SHA-1: {}\n", hex::encode(Sha1::digest(data))));
    header.push('\n');

    let mut out = header.into_bytes();
    let mut padded = vec![0u8; block_size];
    for chunk in data.chunks(block_size) {
        padded[..chunk.len()].copy_from_slice(chunk);
        padded[chunk.len()..].fill(0);

        Rsum::of_block(&padded, block_size).to_wire(rsum_bytes, &mut out);
        out.extend_from_slice(&md4_block(&padded)[..checksum_bytes]);
    }

    Ok(out)
}

/// Pick `(seq_matches, rsum_bytes, checksum_bytes)` the way zsyncmake
/// does: two sequential matches once the file exceeds one block, then
/// size the checksums so random collisions stay improbable across the
/// whole file.
fn hash_lengths(len: u64, block_size: usize) -> (usize, usize, usize) {
    let seq_matches = if len > block_size as u64 { 2 } else { 1 };

    let len_bits = (len.max(1) as f64).log2();
    let bs_bits = (block_size as f64).log2();
    let blocks = 1 + len / block_size as u64;

    let rsum = ((len_bits + bs_bits - 8.6) / (seq_matches as f64 * 8.0)).ceil() as i64;
    let rsum_bytes = rsum.clamp(2, 4) as usize;

    let strong = ((20.0 + len_bits + (blocks as f64).log2()) / (seq_matches as f64 * 8.0)).ceil()
        as i64;
    let checksum_bytes = strong.clamp(3, 16) as usize;

    (seq_matches, rsum_bytes, checksum_bytes)
}
