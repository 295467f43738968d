//! Top-level synchronization state machine
//!
//! A `SyncSession` owns the parsed control data, the weak-hash index, the
//! known-range bookkeeping and the scratch file, and moves the scratch
//! monotonically toward the target: seeds first, then remote ranges, then
//! truncate + verify + promote.

use crate::checksum::md4_block;
use crate::control::{parse_control, ControlFile, SessionParams};
use crate::error::{Error, Result};
use crate::index::ChecksumIndex;
use crate::matcher::RollingMatcher;
use crate::ranges::RangeSet;
use crate::scratch::ScratchStore;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// How much of the target is materialized so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Empty,
    Partial,
    Complete,
}

/// Result of the final whole-file check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Assembled file matches the control file's SHA-1
    Verified,
    /// No SHA-1 header was present; contents are block-checked only
    Unchecked,
    /// SHA-1 mismatch; the scratch file is kept for inspection
    Corrupt,
}

/// Counters for the end-of-run summary
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferStats {
    pub blocks_from_seeds: u64,
    pub blocks_from_remote: u64,
    pub bytes_received: u64,
}

/// Partial trailing block carried between receive calls.
/// `buf` holds the bytes of `[end - buf.len(), end)`.
#[derive(Debug, Default)]
struct PartialBlock {
    buf: Vec<u8>,
    end: u64,
}

pub struct SyncSession {
    pub(crate) params: SessionParams,
    pub(crate) index: ChecksumIndex,
    pub(crate) known: RangeSet,
    pub(crate) scratch: ScratchStore,
    partial: PartialBlock,
    seen_seeds: Vec<PathBuf>,
    stats: TransferStats,
}

impl SyncSession {
    /// Parse the control stream and set up an empty session whose scratch
    /// file lives in `temp_dir`.
    pub async fn begin<R: AsyncRead + Unpin>(control: R, temp_dir: &Path) -> Result<Self> {
        let control = parse_control(control).await?;
        Self::from_control(control, temp_dir).await
    }

    /// Set up a session from an already-parsed control file.
    pub async fn from_control(control: ControlFile, temp_dir: &Path) -> Result<Self> {
        let scratch = ScratchStore::create_in(temp_dir).await?;
        let index = ChecksumIndex::new(&control.params, control.blocks);

        tracing::info!(
            filelen = control.params.filelen,
            blocks = control.params.block_count,
            block_size = control.params.block_size,
            "session started"
        );
        Ok(Self {
            params: control.params,
            index,
            known: RangeSet::new(),
            scratch,
            partial: PartialBlock::default(),
            seen_seeds: Vec::new(),
            stats: TransferStats::default(),
        })
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn status(&self) -> SessionStatus {
        match self.known.covered_count() {
            0 => SessionStatus::Empty,
            n if n == self.params.block_count as u64 => SessionStatus::Complete,
            _ => SessionStatus::Partial,
        }
    }

    /// Blocks still missing from the scratch file
    pub fn blocks_todo(&self) -> u64 {
        self.params.block_count as u64 - self.known.covered_count()
    }

    /// Scan a local file for usable blocks. Duplicate paths are skipped.
    pub async fn submit_seed_path(&mut self, path: &Path) -> Result<u64> {
        if self.seen_seeds.iter().any(|p| p == path) {
            tracing::debug!(seed = %path.display(), "duplicate seed skipped");
            return Ok(0);
        }
        self.seen_seeds.push(path.to_path_buf());

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::seed(path, e))?;
        self.submit_seed(&mut file, path).await
    }

    /// Scan an arbitrary byte stream for usable blocks; `origin` labels
    /// errors and logs.
    pub async fn submit_seed<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        origin: &Path,
    ) -> Result<u64> {
        let mut matcher = RollingMatcher::new(&self.params);
        let found = matcher.scan_reader(reader, origin, self).await?;
        self.stats.blocks_from_seeds += found;

        tracing::info!(
            seed = %origin.display(),
            blocks = found,
            todo = self.blocks_todo(),
            "seed scanned"
        );
        Ok(found)
    }

    /// Move the scratch file to its working name (`<target>.part`).
    pub async fn rename_scratch(&mut self, path: &Path) -> Result<()> {
        self.scratch.rename(path).await
    }

    /// Byte ranges still needed from a mirror, closed intervals. The last
    /// range may extend past `filelen`; `complete` truncates the excess.
    pub fn needed_byte_ranges(&self) -> Vec<(u64, u64)> {
        let bs = self.params.block_size as u64;
        self.known
            .complement(0, self.params.block_count - 1)
            .into_iter()
            .map(|(lo, hi)| (lo as u64 * bs, (hi as u64 + 1) * bs - 1))
            .collect()
    }

    /// Persist verified block content: write, drop from the index, mark
    /// known. `data` must span exactly blocks `lo..=hi`.
    pub(crate) async fn write_blocks(&mut self, lo: u32, hi: u32, data: &[u8]) -> Result<()> {
        let bs = self.params.block_size;
        debug_assert_eq!(data.len(), (hi - lo + 1) as usize * bs);

        self.scratch.write_bytes(lo as u64 * bs as u64, data).await?;
        for bid in lo..=hi {
            self.index.remove(bid);
            self.known.insert(bid);
        }
        Ok(())
    }

    /// Feed one contiguous chunk of a remote response.
    ///
    /// Chunks may arrive at arbitrary disjoint offsets; a trailing partial
    /// block is buffered until the next chunk continues it. A zero-length
    /// call whose offset matches the buffered tail zero-pads and submits
    /// it (the final short block of the target).
    pub async fn receive_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let bs = self.params.block_size as u64;

        if data.is_empty() {
            if !self.partial.buf.is_empty() && self.partial.end == offset {
                let start = self.partial.end - self.partial.buf.len() as u64;
                let bid = (start / bs) as u32;
                let mut block = std::mem::take(&mut self.partial.buf);
                block.resize(bs as usize, 0);
                self.submit_remote(&block, bid, bid).await?;
            }
            return Ok(());
        }

        let mut offset = offset;
        let mut data = data;
        self.stats.bytes_received += data.len() as u64;

        // Continue the pending partial block if this chunk extends it.
        if !self.partial.buf.is_empty() {
            if self.partial.end == offset {
                let need = bs as usize - self.partial.buf.len();
                let take = need.min(data.len());
                self.partial.buf.extend_from_slice(&data[..take]);
                self.partial.end += take as u64;
                offset += take as u64;
                data = &data[take..];

                if self.partial.buf.len() == bs as usize {
                    let start = self.partial.end - bs;
                    let bid = (start / bs) as u32;
                    let block = std::mem::take(&mut self.partial.buf);
                    self.submit_remote(&block, bid, bid).await?;
                } else {
                    return Ok(());
                }
            } else {
                tracing::debug!(
                    pending = self.partial.buf.len(),
                    expected = self.partial.end,
                    got = offset,
                    "discarding stale partial block"
                );
                self.partial.buf.clear();
            }
        }

        // A misaligned start with no pending prefix cannot be verified.
        if offset % bs != 0 {
            let skip = ((bs - offset % bs) as usize).min(data.len());
            tracing::debug!(offset, skipped = skip, "dropping unaligned chunk prefix");
            offset += skip as u64;
            data = &data[skip..];
        }

        // Whole blocks straight out of the chunk.
        let whole = data.len() as u64 / bs;
        if whole > 0 {
            let lo = (offset / bs) as u32;
            let hi = lo + whole as u32 - 1;
            if hi >= self.params.block_count {
                return Err(Error::fetch(
                    "remote",
                    format!("response data past end of file at offset {}", offset),
                ));
            }
            let take = (whole * bs) as usize;
            self.submit_remote(&data[..take], lo, hi).await?;
            offset += take as u64;
            data = &data[take..];
        }

        // Save the tail for the next chunk.
        if !data.is_empty() {
            self.partial.buf.clear();
            self.partial.buf.extend_from_slice(data);
            self.partial.end = offset + data.len() as u64;
        }
        Ok(())
    }

    /// Zero-pad and submit any buffered trailing partial block.
    pub async fn flush_partial(&mut self) -> Result<()> {
        let end = self.partial.end;
        self.receive_bytes(end, &[]).await
    }

    /// Verify and persist remotely fetched blocks `lo..=hi`. On the first
    /// strong-sum mismatch the verified prefix is still written, the rest
    /// is discarded and the caller re-requests from another mirror.
    async fn submit_remote(&mut self, data: &[u8], lo: u32, hi: u32) -> Result<()> {
        let bs = self.params.block_size;
        for (i, bid) in (lo..=hi).enumerate() {
            let digest = md4_block(&data[i * bs..(i + 1) * bs]);
            if !self.index.strong_matches(bid, &digest) {
                if bid > lo {
                    let good = (bid - lo) as usize * bs;
                    self.write_blocks(lo, bid - 1, &data[..good]).await?;
                    self.stats.blocks_from_remote += (bid - lo) as u64;
                }
                tracing::warn!(block = bid, "received block failed checksum");
                return Err(Error::CorruptRemoteBlock { lo: bid, hi });
            }
        }
        self.write_blocks(lo, hi, data).await?;
        self.stats.blocks_from_remote += (hi - lo + 1) as u64;
        Ok(())
    }

    /// Truncate the scratch to the exact target length and run the
    /// whole-file SHA-1 check when the header provided one.
    pub async fn complete(&mut self) -> Result<VerifyOutcome> {
        self.scratch.truncate(self.params.filelen).await?;
        self.scratch.sync().await?;

        let Some(expected) = self.params.sha1 else {
            tracing::info!("control file carries no SHA-1; skipping final verification");
            return Ok(VerifyOutcome::Unchecked);
        };

        let mut hasher = Sha1::new();
        let mut pos = 0u64;
        while pos < self.params.filelen {
            let len = (64 * 1024).min((self.params.filelen - pos) as usize);
            let chunk = self.scratch.read_bytes(pos, len).await?;
            hasher.update(&chunk);
            pos += len as u64;
        }
        let actual: [u8; 20] = hasher.finalize().into();

        if actual == expected {
            tracing::info!(sha1 = %hex::encode(actual), "whole-file SHA-1 verified");
            Ok(VerifyOutcome::Verified)
        } else {
            tracing::error!(
                expected = %hex::encode(expected),
                actual = %hex::encode(actual),
                "whole-file SHA-1 mismatch"
            );
            Ok(VerifyOutcome::Corrupt)
        }
    }

    /// Promote the scratch file to `target`, backing up any existing file
    /// to `<target>.zs-old` and restoring the header mtime when known.
    pub async fn finalize(self, target: &Path) -> Result<()> {
        let mtime = self.params.mtime;
        let scratch_path = self.scratch.detach();

        if tokio::fs::metadata(target).await.is_ok() {
            let mut backup = target.as_os_str().to_os_string();
            backup.push(".zs-old");
            let backup = PathBuf::from(backup);

            let _ = tokio::fs::remove_file(&backup).await;
            if let Err(e) = tokio::fs::hard_link(target, &backup).await {
                tracing::debug!(error = %e, "hard-link backup failed, falling back to rename");
                tokio::fs::rename(target, &backup)
                    .await
                    .map_err(|e| Error::io("backing up existing target", e))?;
            }
            tracing::info!(backup = %backup.display(), "existing target backed up");
        }

        tokio::fs::rename(&scratch_path, target)
            .await
            .map_err(|e| Error::io("moving assembled file into place", e))?;

        if let Some(mtime) = mtime {
            let file = std::fs::File::options()
                .write(true)
                .open(target)
                .map_err(|e| Error::io("opening target to set mtime", e))?;
            file.set_times(std::fs::FileTimes::new().set_modified(mtime))
                .map_err(|e| Error::io("restoring target mtime", e))?;
        }

        tracing::info!(target = %target.display(), "target finalized");
        Ok(())
    }

    /// Abandon the session, deleting the scratch file.
    pub async fn abort(self) -> Result<()> {
        self.scratch.release().await
    }
}
