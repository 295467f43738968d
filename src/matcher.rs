//! Sliding-window block matcher over seed streams
//!
//! Scans an arbitrary byte stream for target blocks at any byte offset.
//! A window of `block_size * seq_matches` bytes slides one byte at a time;
//! its weak sums probe the index and survivors are confirmed by MD4 before
//! the block is written into the scratch file. After a hit the window jumps
//! a whole block and the matcher predicts the next sequential block, which
//! lets runs of consecutive blocks match without re-probing the index.

use crate::checksum::{md4_block, Rsum};
use crate::control::SessionParams;
use crate::error::{Error, Result};
use crate::session::SyncSession;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Blocks of seed data read per buffer refill
const BUFFER_BLOCKS: usize = 16;

/// Scan state for one seed stream.
pub struct RollingMatcher {
    block_size: usize,
    block_shift: u32,
    seq_matches: usize,
    /// Window size: `block_size * seq_matches`
    context: usize,
    block_count: u32,
    buf: Vec<u8>,
    /// Valid bytes in `buf`, including EOF zero padding
    len: usize,
    /// Window offset to resume at after the next refill
    skip: usize,
    /// Rolling sums must be recomputed on buffer entry
    recalc: bool,
    first: bool,
    r: [Rsum; 2],
    /// Predicted continuation block from the previous match
    next_match: Option<u32>,
    /// Blocks recovered so far by this scan
    found: u64,
}

impl RollingMatcher {
    pub fn new(params: &SessionParams) -> Self {
        Self {
            block_size: params.block_size,
            block_shift: params.block_shift,
            seq_matches: params.seq_matches,
            context: params.context(),
            block_count: params.block_count,
            buf: Vec::new(),
            len: 0,
            skip: 0,
            recalc: true,
            first: true,
            r: [Rsum::default(); 2],
            next_match: None,
            found: 0,
        }
    }

    /// Stream `reader` through the window, writing every recovered block
    /// into the session's scratch file. Returns the number of blocks found.
    ///
    /// Each refill keeps the last `context` bytes of the previous buffer
    /// as a prefix so matches spanning the boundary are still seen; at EOF
    /// the tail is zero-padded by one window so final partial content can
    /// match the (zero-padded) last target block.
    pub async fn scan_reader<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        origin: &Path,
        sess: &mut SyncSession,
    ) -> Result<u64> {
        let read_chunk = BUFFER_BLOCKS * self.block_size;
        self.buf.resize(read_chunk + 2 * self.context, 0);

        let mut eof = false;
        while !eof {
            let carry = if self.first {
                0
            } else {
                self.buf.copy_within(self.len - self.context..self.len, 0);
                self.context
            };

            let mut got = 0usize;
            while got < read_chunk {
                let n = reader
                    .read(&mut self.buf[carry + got..carry + read_chunk])
                    .await
                    .map_err(|e| Error::seed(origin.to_path_buf(), e))?;
                if n == 0 {
                    eof = true;
                    break;
                }
                got += n;
            }
            self.len = carry + got;

            if eof {
                if self.first && got == 0 {
                    break;
                }
                self.buf[self.len..self.len + self.context].fill(0);
                self.len += self.context;
            }

            self.process_buffer(sess).await?;
            self.first = false;
        }
        Ok(self.found)
    }

    /// Slide the window over the current buffer contents.
    async fn process_buffer(&mut self, sess: &mut SyncSession) -> Result<()> {
        let bs = self.block_size;
        let limit = self.len - self.context;

        let mut x = self.skip;
        self.skip = 0;
        if x >= limit {
            self.skip = x - limit;
            return Ok(());
        }

        if self.recalc {
            self.r[0] = Rsum::of_block(&self.buf[x..x + bs], bs);
            if self.seq_matches > 1 {
                self.r[1] = Rsum::of_block(&self.buf[x + bs..x + 2 * bs], bs);
            }
            self.recalc = false;
        }

        while x < limit {
            match self.try_match(x, sess).await? {
                Some(advanced) => {
                    let step = advanced * bs;
                    x += step;
                    if x >= limit {
                        self.skip = x - limit;
                        self.recalc = true;
                        break;
                    }
                    if self.seq_matches > 1 && advanced == 1 {
                        self.r[0] = self.r[1];
                    } else {
                        self.r[0] = Rsum::of_block(&self.buf[x..x + bs], bs);
                    }
                    if self.seq_matches > 1 {
                        self.r[1] = Rsum::of_block(&self.buf[x + bs..x + 2 * bs], bs);
                    }
                }
                None => {
                    self.r[0].roll(self.buf[x], self.buf[x + bs], self.block_shift);
                    if self.seq_matches > 1 {
                        self.r[1].roll(self.buf[x + bs], self.buf[x + 2 * bs], self.block_shift);
                    }
                    x += 1;
                }
            }
        }
        Ok(())
    }

    /// Probe the index at window position `x`; on success write the
    /// matching block(s) and return how many blocks the window advances.
    async fn try_match(&mut self, x: usize, sess: &mut SyncSession) -> Result<Option<usize>> {
        let bs = self.block_size;
        let mut digest0: Option<[u8; 16]> = None;
        let mut digest1: Option<[u8; 16]> = None;

        // Sequential continuation: the block after the previous match needs
        // only one weak hit, so a run of consecutive blocks keeps matching
        // even when seq_matches demands pairs.
        if self.seq_matches > 1 {
            if let Some(predicted) = self.next_match.take() {
                if sess.index.is_active(predicted) && sess.index.weak_matches(predicted, self.r[0])
                {
                    let d = *digest0.get_or_insert_with(|| md4_block(&self.buf[x..x + bs]));
                    if sess.index.strong_matches(predicted, &d) {
                        self.accept(predicted, 1, x, sess).await?;
                        return Ok(Some(1));
                    }
                }
            }
        }

        let mut cur = sess.index.lookup(self.r[0], self.r[1]);
        let mut advanced = None;
        while let Some(bid) = cur {
            // Grab the successor first: accepting unlinks nodes from the
            // chain, and a stale link still leads back into it.
            cur = sess.index.chain_next(bid);

            if !sess.index.is_active(bid) || !sess.index.weak_matches(bid, self.r[0]) {
                continue;
            }
            if self.seq_matches > 1 {
                // A pair ending past the block table can never verify.
                if bid + 1 >= self.block_count || !sess.index.weak_matches(bid + 1, self.r[1]) {
                    continue;
                }
            }

            let d0 = *digest0.get_or_insert_with(|| md4_block(&self.buf[x..x + bs]));
            if !sess.index.strong_matches(bid, &d0) {
                continue;
            }
            if self.seq_matches > 1 {
                let d1 = *digest1.get_or_insert_with(|| md4_block(&self.buf[x + bs..x + 2 * bs]));
                if !sess.index.strong_matches(bid + 1, &d1) {
                    continue;
                }
            }

            self.accept(bid, self.seq_matches, x, sess).await?;
            advanced = Some(self.seq_matches);
        }
        Ok(advanced)
    }

    /// Persist an accepted match and set up the sequential prediction.
    async fn accept(
        &mut self,
        bid: u32,
        count: usize,
        x: usize,
        sess: &mut SyncSession,
    ) -> Result<()> {
        let bs = self.block_size;
        let hi = bid + count as u32 - 1;
        sess.write_blocks(bid, hi, &self.buf[x..x + count * bs]).await?;
        self.found += count as u64;

        let next = bid + count as u32;
        self.next_match = if next < self.block_count && !sess.known.contains(next) {
            Some(next)
        } else {
            None
        };

        tracing::trace!(block = bid, count, "matched seed data");
        Ok(())
    }
}
