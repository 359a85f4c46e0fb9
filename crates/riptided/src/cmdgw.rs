//! Command gateway — the line-oriented control channel over loopback TCP.
//!
//! Commands are CRLF-terminated; TUNNELSEND is followed by a raw payload of
//! the announced size. The TCP stream fragments arbitrarily: the parser
//! buffers until it has a full line (and, for tunnels, the full payload)
//! before acting, and tolerates further commands packed behind either.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use riptide_core::{swarm_id_hex, SWARM_ID_ZERO};

use crate::engine::{ConnId, CtrlEvent, EngineCmd};

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

pub async fn serve(listener: TcpListener, cmd_tx: mpsc::UnboundedSender<EngineCmd>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "cmdgw accept failed");
                continue;
            }
        };
        tracing::debug!(%peer, "control client connected");
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, cmd_tx).await {
                tracing::debug!(error = %e, "control client ended");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
) -> Result<()> {
    let conn: ConnId = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
    let (mut rd, mut wr) = stream.into_split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<CtrlEvent>();
    cmd_tx.send(EngineCmd::Subscribe { conn, tx: event_tx })?;

    // Writer side: render engine events onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let result = match event {
                CtrlEvent::Line(line) => wr.write_all(format!("{line}\r\n").as_bytes()).await,
                CtrlEvent::Packet(data) => wr.write_all(&data).await,
                CtrlEvent::Close => break,
            };
            if result.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    // Reader side: reassemble lines and tunnel payloads.
    let mut buffer = BytesMut::new();
    let mut pending_tunnel: Option<(std::net::SocketAddr, u32, usize)> = None;
    let mut chunk = vec![0u8; 8192];
    'read: loop {
        // Drain everything already buffered before reading more.
        loop {
            if let Some((addr, channel, size)) = pending_tunnel {
                if buffer.len() < size {
                    break;
                }
                let payload = buffer.split_to(size).freeze();
                pending_tunnel = None;
                cmd_tx.send(EngineCmd::TunnelSend {
                    addr,
                    channel,
                    payload,
                })?;
                continue;
            }
            let Some(pos) = find_crlf(&buffer) else {
                break;
            };
            let line = buffer.split_to(pos);
            buffer.advance(2);
            let line = String::from_utf8_lossy(&line).into_owned();
            match dispatch_line(&line, conn, &cmd_tx)? {
                Dispatch::Continue => {}
                Dispatch::Tunnel(addr, channel, size) => {
                    pending_tunnel = Some((addr, channel, size));
                }
                Dispatch::Quit => break 'read,
            }
        }
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    cmd_tx.send(EngineCmd::Unsubscribe { conn }).ok();
    // The writer drains remaining events (a trailing ERROR line included)
    // and exits once the engine drops this connection's sender.
    let _ = writer.await;
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

enum Dispatch {
    Continue,
    Tunnel(std::net::SocketAddr, u32, usize),
    Quit,
}

/// Parse one command line and forward it to the engine. A malformed line
/// yields an ERROR with the zero swarm id and closes the connection.
fn dispatch_line(
    line: &str,
    conn: ConnId,
    cmd_tx: &mpsc::UnboundedSender<EngineCmd>,
) -> Result<Dispatch> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(Dispatch::Continue);
    }
    tracing::debug!(conn, line, "control command");
    let words: Vec<&str> = line.split(' ').collect();

    match words.as_slice() {
        ["START", url] => {
            cmd_tx.send(EngineCmd::Start {
                url: url.to_string(),
                dest: None,
                conn,
            })?;
        }
        ["START", url, dest] => {
            cmd_tx.send(EngineCmd::Start {
                url: url.to_string(),
                dest: Some(PathBuf::from(dest)),
                conn,
            })?;
        }
        ["REMOVE", root, rm_content, rm_state] => {
            let Some(root) = riptide_core::parse_swarm_id(root) else {
                return error_out(conn, cmd_tx, "bad root hash");
            };
            cmd_tx.send(EngineCmd::Remove {
                root,
                rm_content: *rm_content == "1",
                rm_state: *rm_state == "1",
            })?;
        }
        ["CHECKPOINT", root] => {
            let Some(root) = riptide_core::parse_swarm_id(root) else {
                return error_out(conn, cmd_tx, "bad root hash");
            };
            cmd_tx.send(EngineCmd::Checkpoint { root })?;
        }
        ["MAXSPEED", root, direction, speed] => {
            let Some(root) = riptide_core::parse_swarm_id(root) else {
                return error_out(conn, cmd_tx, "bad root hash");
            };
            let Ok(bytes_per_sec) = speed.parse::<f64>() else {
                return error_out(conn, cmd_tx, "bad speed");
            };
            let upload = match *direction {
                "UPLOAD" => true,
                "DOWNLOAD" => false,
                _ => return error_out(conn, cmd_tx, "bad direction"),
            };
            cmd_tx.send(EngineCmd::MaxSpeed {
                root,
                upload,
                bytes_per_sec,
            })?;
        }
        ["SETMOREINFO", root, flag] => {
            let Some(root) = riptide_core::parse_swarm_id(root) else {
                return error_out(conn, cmd_tx, "bad root hash");
            };
            cmd_tx.send(EngineCmd::SetMoreInfo {
                root,
                on: *flag == "1",
            })?;
        }
        ["TUNNELSEND", target, size] => {
            let Some((addr, channel)) = crate::tunnel::parse_target(target) else {
                return error_out(conn, cmd_tx, "bad tunnel target");
            };
            let Ok(size) = size.parse::<usize>() else {
                return error_out(conn, cmd_tx, "bad tunnel size");
            };
            return Ok(Dispatch::Tunnel(addr, channel, size));
        }
        ["SHUTDOWN"] => {
            cmd_tx.send(EngineCmd::Shutdown)?;
            return Ok(Dispatch::Quit);
        }
        _ => return error_out(conn, cmd_tx, "unknown command"),
    }
    Ok(Dispatch::Continue)
}

fn error_out(
    conn: ConnId,
    cmd_tx: &mpsc::UnboundedSender<EngineCmd>,
    msg: &str,
) -> Result<Dispatch> {
    cmd_tx.send(EngineCmd::ErrorLine {
        conn,
        line: format!("ERROR {} {msg}", swarm_id_hex(&SWARM_ID_ZERO)),
    })?;
    Ok(Dispatch::Quit)
}

