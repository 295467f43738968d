//! HTTP range client: redirects, single-range and multipart/byteranges
//! responses, all exposed as a stream of `(offset, bytes)` chunks.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::RangeStream;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE, REFERER};
use reqwest::{redirect, Client, Response, StatusCode};
use std::collections::VecDeque;
use url::Url;

/// HTTP client for byte-range requests against target mirrors.
///
/// Redirects are followed manually so that a 3xx without `Location` can
/// be reported distinctly and so the caller learns the final URL (used as
/// the base for relative `URL` headers). The referer is an explicit field
/// here rather than process-global state.
pub struct HttpRangeClient {
    client: Client,
    referer: Option<String>,
    max_redirects: usize,
}

impl HttpRangeClient {
    pub fn new(config: &Config, referer: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::config(format!("building HTTP client: {}", e)))?;
        Ok(Self {
            client,
            referer,
            max_redirects: config.max_redirects,
        })
    }

    /// GET `url` following redirects; returns the body and the final URL.
    /// Used for fetching the control file itself.
    pub async fn get_following_redirects(&self, url: &str) -> Result<(Bytes, String)> {
        let (resp, final_url) = self.request(url, None).await?;
        let body = resp.bytes().await.map_err(|e| Error::RemoteFetch {
            url: final_url.clone(),
            message: "reading response body".into(),
            source: Some(e),
        })?;
        Ok((body, final_url))
    }

    /// Request the given closed byte ranges, yielding `(offset, bytes)`.
    ///
    /// Handles `206` single-range, `206 multipart/byteranges` (offsets
    /// taken from each part's `Content-Range`), and a `200` that ignores
    /// the Range header and replays the whole file from offset zero.
    pub async fn fetch_ranges(&self, url: &str, ranges: &[(u64, u64)]) -> Result<RangeStream> {
        let header = format!(
            "bytes={}",
            ranges
                .iter()
                .map(|(s, e)| format!("{}-{}", s, e))
                .collect::<Vec<_>>()
                .join(",")
        );
        let (resp, final_url) = self.request(url, Some(header)).await?;

        if resp.status() == StatusCode::OK {
            return Ok(body_stream(resp, 0, final_url));
        }

        // 206 Partial Content from here on.
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if let Some(boundary) = multipart_boundary(&content_type) {
            return Ok(multipart_stream(resp, boundary, final_url));
        }

        let offset = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .map(|(start, _)| start)
            .or_else(|| ranges.first().map(|r| r.0))
            .unwrap_or(0);
        Ok(body_stream(resp, offset, final_url))
    }

    /// Issue a GET, following 301/302/307 manually. Returns the response
    /// and the URL it finally came from.
    async fn request(&self, url: &str, range: Option<String>) -> Result<(Response, String)> {
        let mut current = url.to_string();
        for _ in 0..=self.max_redirects {
            let mut req = self.client.get(&current);
            if let Some(r) = &range {
                req = req.header(RANGE, r.clone());
            }
            if let Some(referer) = &self.referer {
                req = req.header(REFERER, referer.clone());
            }

            let resp = req.send().await.map_err(|e| Error::RemoteFetch {
                url: current.clone(),
                message: "request failed".into(),
                source: Some(e),
            })?;

            match resp.status().as_u16() {
                301 | 302 | 307 => {
                    let location = resp
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| Error::NoLocationHeader {
                            url: current.clone(),
                        })?;
                    let next = Url::parse(&current)
                        .and_then(|base| base.join(&location))
                        .map_err(|e| {
                            Error::fetch(&current, format!("bad redirect target {:?}: {}", location, e))
                        })?;
                    tracing::debug!(from = %current, to = %next, "following redirect");
                    current = next.to_string();
                }
                200 | 206 => return Ok((resp, current)),
                code => {
                    return Err(Error::HttpStatus {
                        url: current,
                        code,
                        message: resp
                            .status()
                            .canonical_reason()
                            .unwrap_or("unexpected status")
                            .to_string(),
                    })
                }
            }
        }
        Err(Error::fetch(url, "too many redirects"))
    }
}

/// Stream a plain response body as chunks with a running offset.
fn body_stream(resp: Response, start: u64, url: String) -> RangeStream {
    let body = resp.bytes_stream();
    Box::pin(futures::stream::try_unfold(
        (body, start),
        move |(mut body, mut offset)| {
            let url = url.clone();
            async move {
                match body.next().await {
                    None => Ok(None),
                    Some(Err(e)) => Err(Error::RemoteFetch {
                        url,
                        message: "reading response body".into(),
                        source: Some(e),
                    }),
                    Some(Ok(chunk)) => {
                        let at = offset;
                        offset += chunk.len() as u64;
                        Ok(Some(((at, chunk), (body, offset))))
                    }
                }
            }
        },
    ))
}

/// Stream a `multipart/byteranges` body, decoding each part's offset from
/// its `Content-Range` header.
fn multipart_stream(resp: Response, boundary: String, url: String) -> RangeStream {
    struct State<S> {
        body: S,
        parser: MultipartParser,
        queue: VecDeque<(u64, Bytes)>,
    }
    let state = State {
        body: resp.bytes_stream(),
        parser: MultipartParser::new(&boundary),
        queue: VecDeque::new(),
    };

    Box::pin(futures::stream::try_unfold(state, move |mut st| {
        let url = url.clone();
        async move {
            loop {
                if let Some(item) = st.queue.pop_front() {
                    return Ok(Some((item, st)));
                }
                match st.body.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => {
                        return Err(Error::RemoteFetch {
                            url,
                            message: "reading multipart body".into(),
                            source: Some(e),
                        })
                    }
                    Some(Ok(chunk)) => st
                        .parser
                        .feed(&chunk, &mut st.queue)
                        .map_err(|msg| Error::fetch(&url, msg))?,
                }
            }
        }
    }))
}

/// Extract the boundary parameter of a `multipart/byteranges` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if !parts
        .next()?
        .trim()
        .eq_ignore_ascii_case("multipart/byteranges")
    {
        return None;
    }
    for param in parts {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Parse `bytes S-E/T` into `(S, E)`.
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, _total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

#[derive(Debug)]
enum ParseState {
    /// Skipping to the next boundary marker
    Boundary,
    /// Accumulating part headers up to the blank line
    Headers,
    /// Emitting part payload
    Body { offset: u64, remaining: u64 },
    Done,
}

/// Incremental `multipart/byteranges` decoder. Part payloads pass through
/// without buffering; only boundary and header regions accumulate.
struct MultipartParser {
    /// Boundary marker including the leading dashes
    marker: Vec<u8>,
    buf: Vec<u8>,
    state: ParseState,
}

impl MultipartParser {
    fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{}", boundary).into_bytes(),
            buf: Vec::new(),
            state: ParseState::Boundary,
        }
    }

    fn feed(
        &mut self,
        chunk: &[u8],
        out: &mut VecDeque<(u64, Bytes)>,
    ) -> std::result::Result<(), String> {
        self.buf.extend_from_slice(chunk);
        loop {
            match &mut self.state {
                ParseState::Boundary => {
                    let Some(pos) = find(&self.buf, &self.marker) else {
                        // Keep only a tail that could still begin a marker.
                        let keep = self.marker.len() + 3;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        return Ok(());
                    };
                    let after = pos + self.marker.len();
                    if self.buf.len() < after + 2 {
                        return Ok(());
                    }
                    if &self.buf[after..after + 2] == b"--" {
                        self.state = ParseState::Done;
                        continue;
                    }
                    let mut skip = after;
                    if self.buf.get(skip) == Some(&b'\r') {
                        skip += 1;
                    }
                    if self.buf.get(skip) == Some(&b'\n') {
                        skip += 1;
                    }
                    self.buf.drain(..skip);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let (end, sep) = match (find(&self.buf, b"\r\n\r\n"), find(&self.buf, b"\n\n"))
                    {
                        (Some(a), Some(b)) if b < a => (b, 2),
                        (Some(a), _) => (a, 4),
                        (None, Some(b)) => (b, 2),
                        (None, None) => return Ok(()),
                    };
                    let headers = String::from_utf8_lossy(&self.buf[..end]).to_string();
                    self.buf.drain(..end + sep);

                    let range = headers
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.trim()
                                .eq_ignore_ascii_case("content-range")
                                .then(|| parse_content_range(value))
                                .flatten()
                        })
                        .ok_or_else(|| "multipart part without Content-Range".to_string())?;
                    self.state = ParseState::Body {
                        offset: range.0,
                        remaining: range.1 - range.0 + 1,
                    };
                }
                ParseState::Body { offset, remaining } => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let take = (*remaining).min(self.buf.len() as u64) as usize;
                    out.push_back((*offset, Bytes::copy_from_slice(&self.buf[..take])));
                    *offset += take as u64;
                    *remaining -= take as u64;
                    self.buf.drain(..take);
                    if *remaining == 0 {
                        self.state = ParseState::Boundary;
                    } else {
                        return Ok(());
                    }
                }
                ParseState::Done => {
                    self.buf.clear();
                    return Ok(());
                }
            }
        }
    }
}

/// First occurrence of `needle` in `haystack`
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-499/1000"), Some((0, 499)));
        assert_eq!(parse_content_range(" bytes 500-999/1000"), Some((500, 999)));
        assert_eq!(parse_content_range("bytes 12-34/*"), Some((12, 34)));
        assert_eq!(parse_content_range("items 0-4/10"), None);
        assert_eq!(parse_content_range("bytes x-y/10"), None);
    }

    #[test]
    fn test_multipart_boundary() {
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=SEP"),
            Some("SEP".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/byteranges; boundary=\"quoted sep\""),
            Some("quoted sep".to_string())
        );
        assert_eq!(multipart_boundary("application/octet-stream"), None);
    }

    fn run_parser(body: &[u8], boundary: &str, feed_size: usize) -> Vec<(u64, Vec<u8>)> {
        let mut parser = MultipartParser::new(boundary);
        let mut queue = VecDeque::new();
        for chunk in body.chunks(feed_size) {
            parser.feed(chunk, &mut queue).unwrap();
        }
        queue.into_iter().map(|(o, b)| (o, b.to_vec())).collect()
    }

    #[test]
    fn test_multipart_two_parts() {
        let body = b"\r\n--SEP\r\n\
Content-Type: application/octet-stream\r\n\
Content-Range: bytes 0-4/20\r\n\r\n\
AAAAA\r\n--SEP\r\n\
Content-Range: bytes 10-13/20\r\n\r\n\
BBBB\r\n--SEP--\r\n";

        for feed_size in [1, 3, 7, body.len()] {
            let parts = run_parser(body, "SEP", feed_size);
            let mut merged: Vec<(u64, Vec<u8>)> = Vec::new();
            for (off, data) in parts {
                match merged.last_mut() {
                    Some((last_off, last)) if *last_off + last.len() as u64 == off => {
                        last.extend_from_slice(&data)
                    }
                    _ => merged.push((off, data)),
                }
            }
            assert_eq!(
                merged,
                vec![(0, b"AAAAA".to_vec()), (10, b"BBBB".to_vec())],
                "feed size {}",
                feed_size
            );
        }
    }

    #[test]
    fn test_multipart_missing_content_range() {
        let body = b"--SEP\r\nContent-Type: text/plain\r\n\r\nxxx\r\n--SEP--";
        let mut parser = MultipartParser::new("SEP");
        let mut queue = VecDeque::new();
        assert!(parser.feed(body, &mut queue).is_err());
    }
}
