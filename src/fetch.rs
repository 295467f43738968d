//! Remote fetching: mirror rotation, blacklisting, and the receive driver

use crate::error::{Error, Result};
use crate::http::HttpRangeClient;
use crate::progress::FetchProgress;
use crate::session::{SessionStatus, SyncSession};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Stream of `(absolute_offset, payload)` chunks from one range request
pub type RangeStream = Pin<Box<dyn Stream<Item = Result<(u64, Bytes)>> + Send>>;

/// Range-capable fetcher backends
pub enum RangeFetcher {
    /// Real HTTP mirror access
    Http(HttpRangeClient),
    /// In-memory target, used by the test suite
    Memory(memory::MemoryFetcher),
}

impl RangeFetcher {
    /// Request the given closed byte ranges from `url`.
    pub async fn fetch_ranges(&self, url: &str, ranges: &[(u64, u64)]) -> Result<RangeStream> {
        match self {
            RangeFetcher::Http(c) => c.fetch_ranges(url, ranges).await,
            RangeFetcher::Memory(m) => m.fetch_ranges(url, ranges).await,
        }
    }

    /// Backend name for logging
    pub fn name(&self) -> &'static str {
        match self {
            RangeFetcher::Http(_) => "http",
            RangeFetcher::Memory(_) => "memory",
        }
    }
}

#[derive(Debug)]
struct MirrorState {
    url: String,
    dead: bool,
    /// Corrupt-data incidents; the mirror is dropped at the strike limit
    strikes: u32,
}

/// Drives missing-block download: picks a live mirror, requests the
/// remaining byte ranges, and feeds the response into the session's
/// receive path until the file is complete or every mirror has failed.
pub struct RemoteFetchAdapter {
    fetcher: RangeFetcher,
    mirrors: Vec<MirrorState>,
    max_strikes: u32,
    max_ranges_per_request: usize,
}

impl RemoteFetchAdapter {
    pub fn new(
        fetcher: RangeFetcher,
        urls: Vec<String>,
        max_strikes: u32,
        max_ranges_per_request: usize,
    ) -> Self {
        Self {
            fetcher,
            mirrors: urls
                .into_iter()
                .map(|url| MirrorState {
                    url,
                    dead: false,
                    strikes: 0,
                })
                .collect(),
            max_strikes,
            max_ranges_per_request,
        }
    }

    /// Fetch until the session is complete. Mirror failures blacklist the
    /// mirror and move on; corrupt data earns a strike and the affected
    /// ranges are re-requested.
    pub async fn run(&mut self, sess: &mut SyncSession, progress: &FetchProgress) -> Result<()> {
        while sess.status() != SessionStatus::Complete {
            let Some(idx) = self.pick_mirror() else {
                return Err(Error::AllUrlsExhausted);
            };
            let url = self.mirrors[idx].url.clone();

            let mut ranges = sess.needed_byte_ranges();
            ranges.truncate(self.max_ranges_per_request);
            tracing::info!(
                url = %url,
                ranges = ranges.len(),
                todo = sess.blocks_todo(),
                backend = self.fetcher.name(),
                "requesting missing ranges"
            );

            match self.fetch_into(&url, &ranges, sess, progress).await {
                Ok(()) => {}
                Err(Error::CorruptRemoteBlock { lo, hi }) => {
                    let mirror = &mut self.mirrors[idx];
                    mirror.strikes += 1;
                    tracing::warn!(
                        url = %mirror.url,
                        blocks = ?(lo, hi),
                        strikes = mirror.strikes,
                        "mirror served corrupt data"
                    );
                    if mirror.strikes >= self.max_strikes {
                        tracing::warn!(url = %mirror.url, "mirror blacklisted after repeated corruption");
                        mirror.dead = true;
                    }
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(url = %url, error = %e, "mirror failed, trying another");
                    self.mirrors[idx].dead = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fetch_into(
        &self,
        url: &str,
        ranges: &[(u64, u64)],
        sess: &mut SyncSession,
        progress: &FetchProgress,
    ) -> Result<()> {
        let mut stream = self.fetcher.fetch_ranges(url, ranges).await?;
        while let Some(item) = stream.next().await {
            let (offset, chunk) = item?;
            progress.add(chunk.len() as u64);
            sess.receive_bytes(offset, &chunk).await?;
        }
        sess.flush_partial().await
    }

    /// Random live mirror, jittered off the clock; no RNG dependency
    /// needed for picking one of a handful of URLs.
    fn pick_mirror(&self) -> Option<usize> {
        let live: Vec<usize> = self
            .mirrors
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.dead)
            .map(|(i, _)| i)
            .collect();
        if live.is_empty() {
            return None;
        }
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Some(live[(nanos % live.len() as u64) as usize])
    }
}

/// In-memory fetcher serving ranges from a byte buffer, with fault
/// injection for exercising the failover paths.
pub mod memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub struct MemoryFetcher {
        data: Bytes,
        /// Served chunks are split to at most this many bytes
        chunk_size: usize,
        fail_urls: HashSet<String>,
        corrupt_urls: HashSet<String>,
        requests: Arc<Mutex<Vec<(String, Vec<(u64, u64)>)>>>,
    }

    impl MemoryFetcher {
        pub fn new(data: impl Into<Bytes>) -> Self {
            Self {
                data: data.into(),
                chunk_size: 997, // deliberately unaligned
                fail_urls: HashSet::new(),
                corrupt_urls: HashSet::new(),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
            self.chunk_size = chunk_size;
            self
        }

        /// Requests to this URL fail outright.
        pub fn failing_url(mut self, url: &str) -> Self {
            self.fail_urls.insert(url.to_string());
            self
        }

        /// This URL serves bit-flipped payloads.
        pub fn corrupting_url(mut self, url: &str) -> Self {
            self.corrupt_urls.insert(url.to_string());
            self
        }

        /// Log of every request made, in order.
        pub fn requests(&self) -> Vec<(String, Vec<(u64, u64)>)> {
            self.requests.lock().unwrap().clone()
        }

        pub async fn fetch_ranges(&self, url: &str, ranges: &[(u64, u64)]) -> Result<RangeStream> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), ranges.to_vec()));

            if self.fail_urls.contains(url) {
                return Err(Error::HttpStatus {
                    url: url.to_string(),
                    code: 500,
                    message: "injected failure".into(),
                });
            }

            let corrupt = self.corrupt_urls.contains(url);
            let mut chunks: Vec<Result<(u64, Bytes)>> = Vec::new();
            for &(start, end) in ranges {
                // A real server truncates a range reaching past EOF.
                let end = end.min(self.data.len() as u64 - 1);
                if start > end {
                    continue;
                }
                let mut offset = start;
                while offset <= end {
                    let len = (self.chunk_size as u64).min(end - offset + 1) as usize;
                    let mut payload =
                        self.data.slice(offset as usize..offset as usize + len).to_vec();
                    if corrupt {
                        payload[0] ^= 0xff;
                    }
                    chunks.push(Ok((offset, Bytes::from(payload))));
                    offset += len as u64;
                }
            }
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }
}
