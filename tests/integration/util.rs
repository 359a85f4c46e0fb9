//! Shared scaffolding: engine spawning, deterministic content, a raw wire
//! probe speaking the datagram codec, and a line-reading control client.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use riptide_core::codec::{decode_datagram, encode_datagram, DatagramCtx, Handshake, Message};
use riptide_core::SwarmId;
use riptided::{EngineHandle, SpawnOptions};

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Spawn an engine with every gateway on ephemeral loopback ports.
pub async fn engine_with_gateways(dest_dir: &Path) -> Result<EngineHandle> {
    let mut opts = SpawnOptions::new(loopback(), dest_dir.to_path_buf());
    opts.cmdgw = Some(loopback());
    opts.httpgw = Some(loopback());
    opts.statsgw = Some(loopback());
    riptided::spawn(opts).await
}

/// Spawn a bare engine (UDP only).
pub async fn engine(dest_dir: &Path) -> Result<EngineHandle> {
    riptided::spawn(SpawnOptions::new(loopback(), dest_dir.to_path_buf())).await
}

/// Deterministic pseudo-random content, stable across runs.
pub fn content(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|i| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(i as u64 | 1);
            (state >> 33) as u8
        })
        .collect()
}

pub fn write_content(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content(len)).unwrap();
    path
}

/// Poll until `check` passes or the timeout expires.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── Raw wire probe ───────────────────────────────────────────────────────────

/// A test-side peer speaking the wire protocol directly over one socket.
pub struct WireProbe {
    pub socket: UdpSocket,
    pub ctx: DatagramCtx,
    pub my_channel: u32,
    pub their_channel: u32,
    pub peer: SocketAddr,
}

impl WireProbe {
    pub async fn connect(peer: SocketAddr, swarm: SwarmId) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let ctx = DatagramCtx::default();
        let my_channel = 0x6677_8899;
        let mut hs = Handshake::new(my_channel);
        hs.swarm_id = Some(swarm.to_vec());
        let dgram = encode_datagram(&ctx, 0, &[Message::Handshake(hs)])?;
        socket.send_to(&dgram, peer).await?;

        let mut probe = Self {
            socket,
            ctx,
            my_channel,
            their_channel: 0,
            peer,
        };
        // The responder's first datagram carries its handshake.
        let msgs = probe.recv_msgs(Duration::from_secs(5)).await?;
        match msgs.first() {
            Some(Message::Handshake(hs)) => probe.their_channel = hs.channel,
            other => bail!("expected handshake, got {other:?}"),
        }
        Ok(probe)
    }

    pub async fn send(&self, msgs: &[Message]) -> Result<()> {
        let dgram = encode_datagram(&self.ctx, self.their_channel, msgs)?;
        self.socket.send_to(&dgram, self.peer).await?;
        Ok(())
    }

    /// Receive one datagram addressed to our channel and decode it.
    pub async fn recv_msgs(&self, timeout: Duration) -> Result<Vec<Message>> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, _) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
                .await
                .context("timed out waiting for datagram")??;
            let (channel, msgs) = decode_datagram(&self.ctx, &buf[..len])?;
            if channel != self.my_channel && channel != 0 {
                continue;
            }
            if msgs.is_empty() {
                continue; // keepalive
            }
            return Ok(msgs);
        }
    }

    /// Collect messages until a DATA record arrives (or timeout).
    pub async fn collect_until_data(&self, timeout: Duration) -> Result<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut all = Vec::new();
        loop {
            let left = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .context("timed out waiting for DATA")?;
            let msgs = self.recv_msgs(left).await?;
            let has_data = msgs.iter().any(|m| matches!(m, Message::Data { .. }));
            all.extend(msgs);
            if has_data {
                return Ok(all);
            }
        }
    }
}

// ── Control-channel client ───────────────────────────────────────────────────

/// A CRLF-line client for the command gateway.
pub struct CmdClient {
    stream: TcpStream,
    buffer: BytesMut,
}

impl CmdClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buffer: BytesMut::new(),
        })
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send(format!("{line}\r\n").as_bytes()).await
    }

    /// Next CRLF-terminated line, buffering across fragments.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let line = self.buffer.split_to(pos);
                let _ = self.buffer.split_to(2);
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            let left = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .context("timed out waiting for control line")?;
            let mut chunk = vec![0u8; 8192];
            let n = tokio::time::timeout(left, self.stream.read(&mut chunk)).await??;
            if n == 0 {
                bail!("control connection closed");
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read exactly `n` raw bytes (tunnel payloads after a TUNNELRECV).
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.buffer.len() < n {
            let left = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .context("timed out waiting for payload")?;
            let mut chunk = vec![0u8; 8192];
            let got = tokio::time::timeout(left, self.stream.read(&mut chunk)).await??;
            if got == 0 {
                bail!("control connection closed");
            }
            self.buffer.extend_from_slice(&chunk[..got]);
        }
        Ok(self.buffer.split_to(n).to_vec())
    }

    /// Read lines until one starts with `prefix`.
    pub async fn wait_line_with(&mut self, prefix: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .context("timed out waiting for line")?;
            let line = self.read_line(left).await?;
            if line.starts_with(prefix) {
                return Ok(line);
            }
        }
    }
}
