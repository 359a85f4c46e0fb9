//! riptided — the riptide swarm transfer engine.
//!
//! The library surface exists so the daemon binary and the integration
//! tests drive the same code: `spawn` binds the sockets, starts the engine
//! actor and the gateways, and hands back a control handle.

pub mod channel;
pub mod cmdgw;
pub mod engine;
pub mod httpgw;
pub mod scheduler;
pub mod statsgw;
pub mod swarm;
pub mod tunnel;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use riptide_core::config::TransferConfig;
use riptide_core::SwarmId;

pub use engine::{CtrlEvent, Engine, EngineCmd, EngineOptions};

/// Bind-time configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// UDP bind for swarm traffic.
    pub listen: SocketAddr,
    /// TCP bind for the command gateway (loopback only).
    pub cmdgw: Option<SocketAddr>,
    /// TCP bind for the HTTP content gateway (loopback only).
    pub httpgw: Option<SocketAddr>,
    /// TCP bind for the stats web UI (loopback only).
    pub statsgw: Option<SocketAddr>,
    pub dest_dir: PathBuf,
    pub chunk_size: usize,
    pub transfer: TransferConfig,
    pub zerostate_dir: Option<PathBuf>,
    pub progress: bool,
}

impl SpawnOptions {
    pub fn new(listen: SocketAddr, dest_dir: PathBuf) -> Self {
        Self {
            listen,
            cmdgw: None,
            httpgw: None,
            statsgw: None,
            dest_dir,
            chunk_size: riptide_core::wire::DEFAULT_CHUNK_SIZE,
            transfer: TransferConfig::default(),
            zerostate_dir: None,
            progress: false,
        }
    }
}

/// A running engine: the command sender plus the addresses that were
/// actually bound (useful with port 0).
pub struct EngineHandle {
    pub cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    pub udp_addr: SocketAddr,
    pub cmd_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    pub stats_addr: Option<SocketAddr>,
    engine_task: JoinHandle<Result<()>>,
}

impl EngineHandle {
    /// Attach a file as a seeded swarm; resolves once hashing finished.
    pub async fn attach_file(&self, path: PathBuf) -> Result<SwarmId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::AttachFile { path, resp: tx })
            .context("engine gone")?;
        rx.await.context("engine gone")?
    }

    pub async fn attach_dir(&self, path: PathBuf) -> Result<Vec<SwarmId>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::AttachDir { path, resp: tx })
            .context("engine gone")?;
        rx.await.context("engine gone")?
    }

    /// Attach a directory as one multi-file swarm.
    pub async fn attach_multi(&self, path: PathBuf) -> Result<SwarmId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::AttachMulti { path, resp: tx })
            .context("engine gone")?;
        rx.await.context("engine gone")?
    }

    pub async fn attach_live(&self, path: PathBuf, window: Option<u64>) -> Result<SwarmId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::AttachLive {
                path,
                window,
                resp: tx,
            })
            .context("engine gone")?;
        rx.await.context("engine gone")?
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCmd::Shutdown);
    }

    /// Wait for the engine loop to finish.
    pub async fn wait(self) -> Result<()> {
        self.engine_task.await.context("engine task panicked")?
    }
}

/// Bind every requested socket and start the engine actor plus gateways.
/// Failing to bind a socket is fatal here, before anything runs.
pub async fn spawn(opts: SpawnOptions) -> Result<EngineHandle> {
    let socket = bind_udp(opts.listen)
        .with_context(|| format!("cannot bind swarm socket {}", opts.listen))?;
    let udp_addr = socket.local_addr()?;

    let cmd_listener = match opts.cmdgw {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind command gateway {addr}"))?,
        ),
        None => None,
    };
    let http_listener = match opts.httpgw {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind http gateway {addr}"))?,
        ),
        None => None,
    };
    let stats_listener = match opts.statsgw {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind stats gateway {addr}"))?,
        ),
        None => None,
    };
    let cmd_addr = cmd_listener.as_ref().map(|l| l.local_addr()).transpose()?;
    let http_addr = http_listener.as_ref().map(|l| l.local_addr()).transpose()?;
    let stats_addr = stats_listener.as_ref().map(|l| l.local_addr()).transpose()?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(
        EngineOptions {
            dest_dir: opts.dest_dir.clone(),
            chunk_size: opts.chunk_size,
            transfer: opts.transfer.clone(),
            zerostate_dir: opts.zerostate_dir.clone(),
            progress: opts.progress,
            http_addr,
        },
        socket,
        cmd_rx,
    );
    let engine_task = tokio::spawn(engine.run());

    if let Some(listener) = cmd_listener {
        tokio::spawn(cmdgw::serve(listener, cmd_tx.clone()));
    }
    if let Some(listener) = http_listener {
        let tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = httpgw::serve(listener, tx).await {
                tracing::error!(error = %e, "http gateway exited");
            }
        });
    }
    if let Some(listener) = stats_listener {
        let tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = statsgw::serve(listener, tx).await {
                tracing::error!(error = %e, "stats gateway exited");
            }
        });
    }

    Ok(EngineHandle {
        cmd_tx,
        udp_addr,
        cmd_addr,
        http_addr,
        stats_addr,
        engine_task,
    })
}

/// UDP bind through socket2 so the buffer sizes and reuse flags are set
/// before the socket enters the runtime.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.set_send_buffer_size(1 << 20)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
