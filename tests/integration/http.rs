//! HTTP gateway: whole-content GETs, single byte ranges in all three
//! forms, and concurrent requests with independent cursors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use riptide_core::swarm_id_hex;

use crate::*;

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// One HTTP/1.1 GET, parsed by hand: status line, headers, then a body of
/// exactly Content-Length bytes.
async fn http_get(addr: SocketAddr, path: &str, range: Option<&str>) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    if let Some(range) = range {
        request.push_str(&format!("Range: {range}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(70), stream.read_to_end(&mut raw))
        .await
        .context("http response timed out")??;

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .context("no header terminator")?;
    let head = std::str::from_utf8(&raw[..split])?;
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("empty response")?;
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .context("no status code")?
        .parse()?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    if let Some(len) = headers.get("content-length") {
        let len: usize = len.parse()?;
        if body.len() != len {
            bail!("body length {} != content-length {len}", body.len());
        }
    }
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

#[tokio::test]
async fn serves_whole_content() {
    let dir = tempfile::tempdir().unwrap();
    let size = 3 * 1024 + 500;
    let source = write_content(dir.path(), "movie.ts", size);
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_file(source).await.unwrap();

    let resp = http_get(
        engine.http_addr.unwrap(),
        &format!("/{}", swarm_id_hex(&root)),
        None,
    )
    .await
    .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, content(size));
    engine.shutdown();
}

#[tokio::test]
async fn serves_single_byte_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let size = 10 * 1024;
    let source = write_content(dir.path(), "ranged.ts", size);
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_file(source).await.unwrap();
    let path = format!("/{}", swarm_id_hex(&root));
    let addr = engine.http_addr.unwrap();
    let full = content(size);

    // Closed range.
    let resp = http_get(addr, &path, Some("bytes=100-2099")).await.unwrap();
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body.len(), 2000);
    assert_eq!(resp.body, &full[100..2100]);
    assert_eq!(
        resp.headers["content-range"],
        format!("bytes 100-2099/{size}")
    );

    // Open range.
    let resp = http_get(addr, &path, Some("bytes=9000-")).await.unwrap();
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, &full[9000..]);
    assert_eq!(
        resp.headers["content-range"],
        format!("bytes 9000-{}/{size}", size - 1)
    );

    // Suffix range.
    let resp = http_get(addr, &path, Some("bytes=-777")).await.unwrap();
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, &full[size - 777..]);

    // Unsatisfiable.
    let resp = http_get(addr, &path, Some(&format!("bytes={}-", size)))
        .await
        .unwrap();
    assert_eq!(resp.status, 416);
    assert_eq!(resp.headers["content-range"], format!("bytes */{size}"));
    engine.shutdown();
}

#[tokio::test]
async fn concurrent_requests_use_independent_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let size = 64 * 1024;
    let source = write_content(dir.path(), "parallel.ts", size);
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_file(source).await.unwrap();
    let addr = engine.http_addr.unwrap();
    let path = format!("/{}", swarm_id_hex(&root));
    let full = content(size);

    let a = http_get(addr, &path, Some("bytes=0-32767"));
    let b = http_get(addr, &path, Some("bytes=32768-65535"));
    let c = http_get(addr, &path, None);
    let (a, b, c) = tokio::join!(a, b, c);
    assert_eq!(a.unwrap().body, &full[..32768]);
    assert_eq!(b.unwrap().body, &full[32768..]);
    assert_eq!(c.unwrap().body, full);
    engine.shutdown();
}

#[tokio::test]
async fn serves_subfile_of_multifile_swarm() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("MyCollection");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join("anita.ts"), vec![b'a'; 1234]).unwrap();
    std::fs::write(sub.join("harry.ts"), vec![b'h'; 5000]).unwrap();

    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let root = engine.attach_multi(dir.path().to_path_buf()).await.unwrap();
    let addr = engine.http_addr.unwrap();

    let resp = http_get(
        addr,
        &format!("/{}/MyCollection/harry.ts", swarm_id_hex(&root)),
        None,
    )
    .await
    .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, vec![b'h'; 5000]);

    let resp = http_get(
        addr,
        &format!("/{}/MyCollection/harry.ts", swarm_id_hex(&root)),
        Some("bytes=10-19"),
    )
    .await
    .unwrap();
    assert_eq!(resp.status, 206);
    assert_eq!(resp.body, vec![b'h'; 10]);
    assert_eq!(resp.headers["content-range"], "bytes 10-19/5000");
    engine.shutdown();
}

#[tokio::test]
async fn stats_gateway_surface() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_gateways(dir.path()).await.unwrap();
    let addr = engine.stats_addr.unwrap();

    let resp = http_get(addr, "/webUI", None).await.unwrap();
    assert_eq!(resp.status, 200);
    assert!(String::from_utf8_lossy(&resp.body).contains("Swift Web Interface"));

    let resp = http_get(
        addr,
        "/webUI?&%7B%22method%22:%22get_speed_info%22%7D",
        None,
    )
    .await
    .unwrap();
    let text = String::from_utf8_lossy(&resp.body);
    assert!(text.contains("downspeed"), "speed json in {text}");
    assert!(text.contains("upspeed"));

    let resp = http_get(addr, "/webUI/exit", None).await.unwrap();
    assert!(String::from_utf8_lossy(&resp.body).contains("Swift is no longer running"));
    // The engine honors the exit request.
    engine.wait().await.unwrap();
}
