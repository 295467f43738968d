//! Control-file parser: `Key: Value` headers, blank line, raw checksum table

use super::{BlockMeta, ControlFile, SessionParams, CLIENT_VERSION, REJECTED_MAKE_VERSION};
use crate::checksum::Rsum;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Headers that request compressed-stream handling; unsupported.
const COMPRESSED_STREAM_KEYS: &[&str] = &["Z-Filename", "Z-URL", "Z-Map2", "Recompress"];

/// Parse a complete control file from `reader`.
///
/// The header section is newline-terminated `Key: Value` lines up to a
/// blank line; the binary checksum table follows with no framing.
pub async fn parse_control<R: AsyncRead + Unpin>(reader: R) -> Result<ControlFile> {
    let mut reader = BufReader::new(reader);

    let mut filelen: Option<u64> = None;
    let mut block_size: Option<usize> = None;
    let mut seq_matches = 1usize;
    let mut rsum_bytes = 4usize;
    let mut checksum_bytes = 16usize;
    let mut urls = Vec::new();
    let mut sha1: Option<[u8; 20]> = None;
    let mut mtime: Option<SystemTime> = None;
    let mut filename: Option<String> = None;
    let mut safe_keys: HashSet<String> = HashSet::new();

    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await.map_err(|e| {
            Error::control(format!("reading header: {}", e))
        })?;
        if n == 0 {
            return Err(Error::control("unexpected end of file inside header"));
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| Error::control("header line is not valid UTF-8"))?
            .trim_end_matches(['\n', '\r']);
        if text.is_empty() {
            break;
        }

        let (key, value) = text
            .split_once(':')
            .ok_or_else(|| Error::control(format!("header line without colon: {:?}", text)))?;
        let value = value.trim_start();

        match key {
            "zsync" => {
                if value == REJECTED_MAKE_VERSION {
                    return Err(Error::control(format!(
                        "control file from broken zsyncmake {}",
                        REJECTED_MAKE_VERSION
                    )));
                }
            }
            "Min-Version" => {
                if value > CLIENT_VERSION {
                    return Err(Error::control(format!(
                        "control file requires client version {} (this is {})",
                        value, CLIENT_VERSION
                    )));
                }
            }
            "Length" => {
                let len: u64 = value
                    .parse()
                    .map_err(|_| Error::control(format!("invalid Length: {:?}", value)))?;
                if len == 0 {
                    return Err(Error::control("Length must be positive"));
                }
                filelen = Some(len);
            }
            "Filename" => {
                if value.contains('/') {
                    return Err(Error::control(format!(
                        "Filename must not contain '/': {:?}",
                        value
                    )));
                }
                filename = Some(value.to_string());
            }
            "URL" => urls.push(value.to_string()),
            "Blocksize" => {
                let bs: usize = value
                    .parse()
                    .map_err(|_| Error::control(format!("invalid Blocksize: {:?}", value)))?;
                if bs == 0 || !bs.is_power_of_two() {
                    return Err(Error::control(format!(
                        "Blocksize must be a positive power of two, got {}",
                        bs
                    )));
                }
                block_size = Some(bs);
            }
            "Hash-Lengths" => {
                let mut parts = value.split(',').map(|p| p.trim().parse::<usize>());
                let (s, r, c) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(s)), Some(Ok(r)), Some(Ok(c)), None) => (s, r, c),
                    _ => {
                        return Err(Error::control(format!(
                            "invalid Hash-Lengths: {:?}",
                            value
                        )))
                    }
                };
                if !(1..=2).contains(&s) || !(1..=4).contains(&r) || !(3..=16).contains(&c) {
                    return Err(Error::control(format!(
                        "Hash-Lengths out of range: {},{},{}",
                        s, r, c
                    )));
                }
                seq_matches = s;
                rsum_bytes = r;
                checksum_bytes = c;
            }
            "SHA-1" => {
                if value.len() != 40 {
                    return Err(Error::control(format!(
                        "SHA-1 must be 40 hex characters, got {}",
                        value.len()
                    )));
                }
                let digest = hex::decode(value)
                    .map_err(|_| Error::control(format!("invalid SHA-1 hex: {:?}", value)))?;
                let mut out = [0u8; 20];
                out.copy_from_slice(&digest);
                sha1 = Some(out);
            }
            "MTime" => match httpdate::parse_http_date(value) {
                Ok(t) => mtime = Some(t),
                Err(_) => {
                    tracing::warn!(value = %value, "ignoring unparseable MTime header");
                }
            },
            "Safe" => {
                safe_keys.extend(value.split(',').map(|k| k.trim().to_string()));
            }
            k if COMPRESSED_STREAM_KEYS.contains(&k) => {
                return Err(Error::control(format!(
                    "compressed-stream control files are not supported ({})",
                    k
                )));
            }
            k => {
                if !safe_keys.contains(k) {
                    return Err(Error::control(format!("unrecognized header: {:?}", k)));
                }
                tracing::debug!(key = %k, "skipping safelisted header");
            }
        }
    }

    let filelen = filelen.ok_or_else(|| Error::control("missing Length header"))?;
    let block_size = block_size.ok_or_else(|| Error::control("missing Blocksize header"))?;

    let block_count64 = filelen.div_ceil(block_size as u64);
    let block_count = u32::try_from(block_count64)
        .map_err(|_| Error::control(format!("too many blocks: {}", block_count64)))?;

    let params = SessionParams {
        filelen,
        block_size,
        block_shift: block_size.trailing_zeros(),
        block_count,
        seq_matches,
        rsum_bytes,
        checksum_bytes,
        urls,
        sha1,
        mtime,
        filename,
    };

    let blocks = read_block_table(&mut reader, &params).await?;
    Ok(ControlFile { params, blocks })
}

/// Read `block_count` fixed-size records of weak + truncated strong sums
async fn read_block_table<R: AsyncRead + Unpin>(
    reader: &mut R,
    params: &SessionParams,
) -> Result<Vec<BlockMeta>> {
    let record_len = params.record_len();
    let expected = params.block_count as u64 * record_len as u64;

    let mut table = vec![0u8; expected as usize];
    let mut got = 0usize;
    while got < table.len() {
        let n = reader
            .read(&mut table[got..])
            .await
            .map_err(|e| Error::control(format!("reading checksum table: {}", e)))?;
        if n == 0 {
            return Err(Error::BlockMetaTruncated {
                expected,
                got: got as u64,
            });
        }
        got += n;
    }

    let mut blocks = Vec::with_capacity(params.block_count as usize);
    for record in table.chunks_exact(record_len) {
        let mut meta = BlockMeta {
            weak: Rsum::from_wire(&record[..params.rsum_bytes]),
            strong: [0u8; 16],
        };
        meta.strong[..params.checksum_bytes].copy_from_slice(&record[params.rsum_bytes..]);
        blocks.push(meta);
    }

    tracing::debug!(
        blocks = blocks.len(),
        block_size = params.block_size,
        filelen = params.filelen,
        seq_matches = params.seq_matches,
        "parsed control file"
    );
    Ok(blocks)
}
