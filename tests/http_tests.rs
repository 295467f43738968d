//! HTTP client behavior against a canned local server: redirect chains,
//! missing Location headers, error statuses, and range responses.

use futures::StreamExt;
use rangesync::config::Config;
use rangesync::error::Error;
use rangesync::http::HttpRangeClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One scripted response for a request path
#[derive(Clone)]
struct Canned {
    status: u16,
    reason: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Canned {
    fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Serve scripted responses, one connection at a time.
async fn start_server(routes: HashMap<String, Canned>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut req = Vec::new();
                let mut buf = [0u8; 1024];
                while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => req.extend_from_slice(&buf[..n]),
                    }
                }
                let request_line = String::from_utf8_lossy(&req);
                let path = request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();

                let response = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or_else(|| Canned::new(404, "Not Found"));

                let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
                for (name, value) in &response.headers {
                    out.push_str(&format!("{}: {}\r\n", name, value));
                }
                out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
                out.push_str("Connection: close\r\n\r\n");

                let _ = socket.write_all(out.as_bytes()).await;
                let _ = socket.write_all(&response.body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

fn client() -> HttpRangeClient {
    HttpRangeClient::new(&Config::default(), None).unwrap()
}

#[tokio::test]
async fn test_redirect_chain_resolves_final_url() {
    let mut routes = HashMap::new();
    routes.insert(
        "/a".to_string(),
        Canned::new(301, "Moved Permanently").header("Location", "/b"),
    );
    routes.insert(
        "/b".to_string(),
        Canned::new(302, "Found").header("Location", "/c"),
    );
    routes.insert(
        "/c".to_string(),
        Canned::new(307, "Temporary Redirect").header("Location", "/real/control.zsync"),
    );
    routes.insert(
        "/real/control.zsync".to_string(),
        Canned::new(200, "OK").body(&b"the control file"[..]),
    );
    let base = start_server(routes).await;

    let (body, final_url) = client()
        .get_following_redirects(&format!("{}/a", base))
        .await
        .unwrap();
    assert_eq!(&body[..], b"the control file");
    // Block URLs are resolved relative to where the chain landed.
    assert_eq!(final_url, format!("{}/real/control.zsync", base));
}

#[tokio::test]
async fn test_redirect_without_location_fails() {
    let mut routes = HashMap::new();
    routes.insert("/a".to_string(), Canned::new(301, "Moved Permanently"));
    let base = start_server(routes).await;

    let err = client()
        .get_following_redirects(&format!("{}/a", base))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoLocationHeader { .. }));
}

#[tokio::test]
async fn test_not_found_surfaces_status() {
    let base = start_server(HashMap::new()).await;

    let err = client()
        .get_following_redirects(&format!("{}/missing", base))
        .await
        .unwrap_err();
    match err {
        Error::HttpStatus { code, .. } => assert_eq!(code, 404),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_redirect_loop_gives_up() {
    let mut routes = HashMap::new();
    routes.insert(
        "/loop".to_string(),
        Canned::new(302, "Found").header("Location", "/loop"),
    );
    let base = start_server(routes).await;

    let err = client()
        .get_following_redirects(&format!("{}/loop", base))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RemoteFetch { .. }));
}

#[tokio::test]
async fn test_single_range_206() {
    let mut routes = HashMap::new();
    routes.insert(
        "/file".to_string(),
        Canned::new(206, "Partial Content")
            .header("Content-Range", "bytes 100-109/200")
            .body(&b"0123456789"[..]),
    );
    let base = start_server(routes).await;

    let mut stream = client()
        .fetch_ranges(&format!("{}/file", base), &[(100, 109)])
        .await
        .unwrap();

    let mut got = Vec::new();
    while let Some(item) = stream.next().await {
        got.push(item.unwrap());
    }
    let merged: Vec<u8> = got.iter().flat_map(|(_, b)| b.to_vec()).collect();
    assert_eq!(got[0].0, 100);
    assert_eq!(merged, b"0123456789");
}

#[tokio::test]
async fn test_whole_body_200_fallback() {
    let mut routes = HashMap::new();
    routes.insert(
        "/file".to_string(),
        Canned::new(200, "OK").body(&b"entire file content"[..]),
    );
    let base = start_server(routes).await;

    let mut stream = client()
        .fetch_ranges(&format!("{}/file", base), &[(5, 9)])
        .await
        .unwrap();

    let mut offset0 = None;
    let mut merged = Vec::new();
    while let Some(item) = stream.next().await {
        let (off, bytes) = item.unwrap();
        offset0.get_or_insert(off);
        merged.extend_from_slice(&bytes);
    }
    // A server ignoring Range replays from the start of the file.
    assert_eq!(offset0, Some(0));
    assert_eq!(merged, b"entire file content");
}

#[tokio::test]
async fn test_multipart_byteranges_206() {
    let body = b"\r\n--BOUND\r\n\
Content-Range: bytes 0-3/20\r\n\r\n\
AAAA\r\n--BOUND\r\n\
Content-Range: bytes 10-14/20\r\n\r\n\
BBBBB\r\n--BOUND--\r\n";

    let mut routes = HashMap::new();
    routes.insert(
        "/file".to_string(),
        Canned::new(206, "Partial Content")
            .header("Content-Type", "multipart/byteranges; boundary=BOUND")
            .body(&body[..]),
    );
    let base = start_server(routes).await;

    let mut stream = client()
        .fetch_ranges(&format!("{}/file", base), &[(0, 3), (10, 14)])
        .await
        .unwrap();

    let mut parts: Vec<(u64, Vec<u8>)> = Vec::new();
    while let Some(item) = stream.next().await {
        let (off, bytes) = item.unwrap();
        match parts.last_mut() {
            Some((o, data)) if *o + data.len() as u64 == off => data.extend_from_slice(&bytes),
            _ => parts.push((off, bytes.to_vec())),
        }
    }
    assert_eq!(
        parts,
        vec![(0, b"AAAA".to_vec()), (10, b"BBBBB".to_vec())]
    );
}
