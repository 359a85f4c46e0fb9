//! Live swarm: a source appends, signs peaks, and a downloader verifies
//! and serves the stream through its gateway.

use std::time::Duration;

use bytes::Bytes;
use riptide_core::swarm_id_hex;
use riptided::EngineCmd;

use crate::*;

#[tokio::test]
async fn live_stream_reaches_downloader() {
    let src_dir = tempfile::tempdir().unwrap();
    let leech_dir = tempfile::tempdir().unwrap();
    let stream = content(16 * 1024); // 16 chunks

    let source = engine(src_dir.path()).await.unwrap();
    let root = source
        .attach_live(src_dir.path().join("input.stream"), None)
        .await
        .unwrap();

    // First half of the stream exists before the downloader arrives.
    source
        .cmd_tx
        .send(EngineCmd::LiveAppend {
            root,
            data: Bytes::copy_from_slice(&stream[..8 * 1024]),
            eof: false,
        })
        .unwrap();

    let leecher = engine_with_gateways(leech_dir.path()).await.unwrap();
    let mut cmd = CmdClient::connect(leecher.cmd_addr.unwrap()).await.unwrap();
    cmd.send_line(&format!(
        "START tswift://127.0.0.1:{}/{}@-1 {}",
        source.udp_addr.port(),
        swarm_id_hex(&root),
        leech_dir.path().display()
    ))
    .await
    .unwrap();

    wait_for_seqcomp(&mut cmd, &root, 8 * 1024, Duration::from_secs(15)).await;

    // Second half appears while the swarm is running.
    source
        .cmd_tx
        .send(EngineCmd::LiveAppend {
            root,
            data: Bytes::copy_from_slice(&stream[8 * 1024..]),
            eof: false,
        })
        .unwrap();
    wait_for_seqcomp(&mut cmd, &root, 16 * 1024, Duration::from_secs(15)).await;

    // The downloader's gateway serves the verified stream.
    let addr = leecher.http_addr.unwrap();
    let body = http_range(addr, &swarm_id_hex(&root), 0, 16 * 1024 - 1).await;
    assert_eq!(body, stream);

    source.shutdown();
    leecher.shutdown();
}

/// Poll INFO lines until the sequentially-complete byte count reaches
/// `want`.
async fn wait_for_seqcomp(
    cmd: &mut CmdClient,
    root: &riptide_core::SwarmId,
    want: u64,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let left = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("live stream never reached {want} bytes"));
        let line = cmd.wait_line_with("INFO", left).await.unwrap();
        let words: Vec<&str> = line.split(' ').collect();
        if words[1] != swarm_id_hex(root) {
            continue;
        }
        let seqcomp: u64 = words[3].split('/').next().unwrap().parse().unwrap();
        if seqcomp >= want {
            return;
        }
    }
}

/// Minimal ranged GET against the content gateway.
async fn http_range(addr: std::net::SocketAddr, hexroot: &str, first: u64, last: u64) -> Vec<u8> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /{hexroot} HTTP/1.1\r\nHost: localhost\r\nRange: bytes={first}-{last}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(70), stream.read_to_end(&mut raw))
        .await
        .expect("ranged GET timed out")
        .unwrap();
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    raw[split + 4..].to_vec()
}
