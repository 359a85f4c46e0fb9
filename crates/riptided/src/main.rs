//! riptided — swarm transfer engine daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;

use riptide_core::config::RiptideConfig;
use riptide_core::swarm_id_hex;
use riptided::{spawn, EngineCmd, SpawnOptions};

/// Peer-to-peer content transfer engine.
#[derive(Debug, Parser)]
#[command(name = "riptided", version)]
struct Flags {
    /// UDP bind for swarm traffic (ip:port).
    #[arg(short = 'l')]
    listen: Option<String>,

    /// TCP bind for the command channel (loopback).
    #[arg(short = 'c')]
    cmdgw: Option<String>,

    /// TCP bind for the HTTP content gateway (loopback).
    #[arg(short = 'g')]
    httpgw: Option<String>,

    /// TCP bind for the stats web UI (loopback).
    #[arg(short = 's')]
    statsgw: Option<String>,

    /// Destination directory for downloads.
    #[arg(short = 'o')]
    dest_dir: Option<PathBuf>,

    /// Attach a single file as a swarm and seed it.
    #[arg(short = 'f')]
    file: Option<PathBuf>,

    /// Scan a directory and attach each file as a swarm.
    #[arg(short = 'd')]
    scan_dir: Option<PathBuf>,

    /// Zero-state directory for on-demand attach by hex root hash.
    #[arg(short = 'e')]
    zerostate: Option<PathBuf>,

    /// Live source input stream.
    #[arg(short = 'i')]
    live_source: Option<PathBuf>,

    /// Live discard window in chunks.
    #[arg(short = 'W')]
    discard_window: Option<u64>,

    /// Chunk size in bytes.
    #[arg(short = 'z')]
    chunk_size: Option<usize>,

    /// Periodic progress lines on stdout.
    #[arg(short = 'p')]
    progress: bool,

    /// Debug/trace mode.
    #[arg(short = 'B')]
    debug: bool,

    /// Log sink file.
    #[arg(short = 'w')]
    log_file: Option<PathBuf>,
}

fn parse_bind(spec: &str) -> Result<SocketAddr> {
    // RFC2732 bracketed v6 and plain v4 both parse as SocketAddr.
    spec.parse()
        .with_context(|| format!("invalid bind address {spec:?}"))
}

fn init_tracing(flags: &Flags) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = if flags.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if let Some(path) = &flags.log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot open log sink {}", path.display()))?;
        builder
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();
    init_tracing(&flags)?;

    let config = RiptideConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config unreadable, using defaults");
        RiptideConfig::default()
    });

    let listen = match &flags.listen {
        Some(spec) => parse_bind(spec)?,
        None => parse_bind(&config.network.listen)?,
    };
    let mut opts = SpawnOptions::new(
        listen,
        flags
            .dest_dir
            .clone()
            .unwrap_or_else(|| config.storage.dest_dir.clone()),
    );
    opts.cmdgw = flags.cmdgw.as_deref().map(parse_bind).transpose()?;
    opts.httpgw = flags.httpgw.as_deref().map(parse_bind).transpose()?;
    opts.statsgw = flags.statsgw.as_deref().map(parse_bind).transpose()?;
    opts.chunk_size = flags.chunk_size.unwrap_or(config.storage.chunk_size);
    opts.transfer = config.transfer.clone();
    opts.zerostate_dir = flags.zerostate.clone();
    opts.progress = flags.progress;

    let handle = spawn(opts).await?;
    tracing::info!(
        udp = %handle.udp_addr,
        cmd = ?handle.cmd_addr,
        http = ?handle.http_addr,
        stats = ?handle.stats_addr,
        "riptided up"
    );

    if let Some(path) = &flags.file {
        let root = handle.attach_file(path.clone()).await?;
        println!("Root hash: {}", swarm_id_hex(&root));
    }
    if let Some(dir) = &flags.scan_dir {
        for root in handle.attach_dir(dir.clone()).await? {
            println!("Root hash: {}", swarm_id_hex(&root));
        }
    }
    if let Some(source) = &flags.live_source {
        let root = handle
            .attach_live(source.clone(), flags.discard_window)
            .await?;
        println!("Root hash: {}", swarm_id_hex(&root));
        spawn_live_reader(source.clone(), root, handle.cmd_tx.clone());
    }

    handle.wait().await
}

/// Feed the live source file into the engine at a steady pace, as if it
/// were an arriving stream.
fn spawn_live_reader(
    path: PathBuf,
    root: riptide_core::SwarmId,
    cmd_tx: tokio::sync::mpsc::UnboundedSender<EngineCmd>,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open live source");
                return;
            }
        };
        let mut buf = vec![0u8; 16 * 1024];
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            match file.read(&mut buf).await {
                Ok(0) => {
                    let _ = cmd_tx.send(EngineCmd::LiveAppend {
                        root,
                        data: Bytes::new(),
                        eof: true,
                    });
                    break;
                }
                Ok(n) => {
                    let _ = cmd_tx.send(EngineCmd::LiveAppend {
                        root,
                        data: Bytes::copy_from_slice(&buf[..n]),
                        eof: false,
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "live source read failed");
                    break;
                }
            }
        }
    });
}
