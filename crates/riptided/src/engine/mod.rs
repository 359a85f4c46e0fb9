//! The engine actor — one task owns the UDP socket and every piece of
//! mutable protocol state. Gateways talk to it over a command channel and
//! hear back over per-connection event channels; nothing else mutates
//! swarms or channels.

mod recv;
mod send;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use riptide_core::bin::ChunkRange;
use riptide_core::binmap::Binmap;
use riptide_core::codec::{DatagramCtx, Handshake, Message};
use riptide_core::config::TransferConfig;
use riptide_core::merkle::{HashTree, LiveSigner, Verifier};
use riptide_core::{swarm_id_hex, SwarmId, SWARM_ID_ZERO};
use riptide_store::hashcheck;
use riptide_store::live::LiveStorage;
use riptide_store::sidecar::{self, BinmapRecord};
use riptide_store::storage::{FileStorage, SwarmStorage};

use crate::channel::{fresh_channel_id, Channel, ChannelState};
use crate::swarm::{
    DlStatus, Swarm, SwarmContent, SwarmTree, SwarmUrl, TokenBucket,
};

/// Identifies one control-gateway connection for targeted replies.
pub type ConnId = u64;

/// Commands into the engine actor.
pub enum EngineCmd {
    Start {
        url: String,
        dest: Option<PathBuf>,
        conn: ConnId,
    },
    Remove {
        root: SwarmId,
        rm_content: bool,
        rm_state: bool,
    },
    Checkpoint {
        root: SwarmId,
    },
    MaxSpeed {
        root: SwarmId,
        upload: bool,
        bytes_per_sec: f64,
    },
    SetMoreInfo {
        root: SwarmId,
        on: bool,
    },
    TunnelSend {
        addr: SocketAddr,
        channel: u32,
        payload: Bytes,
    },
    Subscribe {
        conn: ConnId,
        tx: mpsc::UnboundedSender<CtrlEvent>,
    },
    Unsubscribe {
        conn: ConnId,
    },
    /// A gateway-detected command error: deliver the line, then close the
    /// offending connection.
    ErrorLine {
        conn: ConnId,
        line: String,
    },
    AttachFile {
        path: PathBuf,
        resp: oneshot::Sender<Result<SwarmId>>,
    },
    AttachDir {
        path: PathBuf,
        resp: oneshot::Sender<Result<Vec<SwarmId>>>,
    },
    /// Attach a directory as ONE multi-file swarm (spec + files).
    AttachMulti {
        path: PathBuf,
        resp: oneshot::Sender<Result<SwarmId>>,
    },
    AttachLive {
        path: PathBuf,
        window: Option<u64>,
        resp: oneshot::Sender<Result<SwarmId>>,
    },
    LiveAppend {
        root: SwarmId,
        data: Bytes,
        eof: bool,
    },
    GwMeta {
        root: SwarmId,
        subpath: Option<String>,
        resp: oneshot::Sender<Option<GwMeta>>,
    },
    GwRead {
        root: SwarmId,
        offset: u64,
        len: usize,
        resp: oneshot::Sender<GwRead>,
    },
    SpeedInfo {
        resp: oneshot::Sender<(f64, f64)>,
    },
    Shutdown,
}

/// Byte extent the gateway may serve for one GET.
#[derive(Debug, Clone, Copy)]
pub struct GwMeta {
    /// Total size of the served entity (sub-file or whole content).
    pub total: u64,
    /// Offset of the entity within the swarm's linear stream.
    pub base: u64,
}

#[derive(Debug)]
pub enum GwRead {
    Data(Bytes),
    /// The range is not yet downloaded; poll again.
    Pending,
    /// Unknown swarm or discarded range.
    Gone,
}

/// Events out to control connections.
#[derive(Debug, Clone)]
pub enum CtrlEvent {
    /// A CRLF-terminated line (terminator appended by the gateway).
    Line(String),
    /// Raw bytes written verbatim (tunnel payloads).
    Packet(Bytes),
    /// The gateway must close this connection (fatal command error).
    Close,
}

/// Engine-wide options resolved from config and flags.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dest_dir: PathBuf,
    pub chunk_size: usize,
    pub transfer: TransferConfig,
    pub zerostate_dir: Option<PathBuf>,
    pub progress: bool,
    /// Advertised HTTP gateway address, for PLAY lines.
    pub http_addr: Option<SocketAddr>,
}

pub struct Engine {
    pub(crate) opts: EngineOptions,
    pub(crate) socket: UdpSocket,
    pub(crate) swarms: HashMap<SwarmId, Swarm>,
    pub(crate) channels: HashMap<u32, Channel>,
    cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    pub(crate) subscribers: HashMap<ConnId, mpsc::UnboundedSender<CtrlEvent>>,
    pub(crate) global_up: TokenBucket,
    pub(crate) total_up: u64,
    pub(crate) total_down: u64,
    speed_sample: (Instant, u64, u64),
    pub(crate) speeds: (f64, f64),
}

/// Microsecond wall-clock timestamp for DATA/ACK records.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Engine {
    pub fn new(
        opts: EngineOptions,
        socket: UdpSocket,
        cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    ) -> Self {
        Self {
            opts,
            socket,
            swarms: HashMap::new(),
            channels: HashMap::new(),
            cmd_rx,
            subscribers: HashMap::new(),
            global_up: TokenBucket::unlimited(),
            total_up: 0,
            total_down: 0,
            speed_sample: (Instant::now(), 0, 0),
            speeds: (0.0, 0.0),
        }
    }

    /// Run until SHUTDOWN. The loop owns every suspension point: socket
    /// readiness, command arrival, and the two timers.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut info_tick = tokio::time::interval(Duration::from_secs(1));
        tracing::info!(addr = %self.socket.local_addr()?, "engine loop running");
        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => {
                            let data = buf[..len].to_vec();
                            self.handle_datagram(&data, from).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "udp recv failed"),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(EngineCmd::Shutdown) | None => break,
                        Some(cmd) => self.handle_cmd(cmd).await,
                    }
                }
                _ = tick.tick() => self.on_tick().await,
                _ = info_tick.tick() => self.emit_info(),
            }
        }
        self.close_all().await;
        tracing::info!("engine loop stopped");
        Ok(())
    }

    async fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Start { url, dest, conn } => {
                if let Err(msg) = self.start_swarm(&url, dest).await {
                    tracing::warn!(url, error = %msg, "START failed");
                    self.send_to_conn(
                        conn,
                        CtrlEvent::Line(format!(
                            "ERROR {} {}",
                            swarm_id_hex(&SWARM_ID_ZERO),
                            msg
                        )),
                    );
                    self.send_to_conn(conn, CtrlEvent::Close);
                }
            }
            EngineCmd::Remove {
                root,
                rm_content,
                rm_state,
            } => self.remove_swarm(&root, rm_content, rm_state).await,
            EngineCmd::Checkpoint { root } => {
                if let Err(e) = self.checkpoint_swarm(&root) {
                    self.broadcast(CtrlEvent::Line(format!(
                        "ERROR {} checkpoint failed: {e}",
                        swarm_id_hex(&root)
                    )));
                }
            }
            EngineCmd::MaxSpeed {
                root,
                upload,
                bytes_per_sec,
            } => {
                if let Some(swarm) = self.swarms.get_mut(&root) {
                    if upload {
                        swarm.up_bucket.set_rate(bytes_per_sec);
                    } else {
                        swarm.down_bucket.set_rate(bytes_per_sec);
                    }
                }
            }
            EngineCmd::SetMoreInfo { root, on } => {
                if let Some(swarm) = self.swarms.get_mut(&root) {
                    swarm.moreinfo = on;
                }
            }
            EngineCmd::TunnelSend {
                addr,
                channel,
                payload,
            } => {
                let data = crate::tunnel::encode(channel, &payload);
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    tracing::warn!(%addr, error = %e, "tunnel send failed");
                }
            }
            EngineCmd::Subscribe { conn, tx } => {
                self.subscribers.insert(conn, tx);
            }
            EngineCmd::Unsubscribe { conn } => {
                self.subscribers.remove(&conn);
            }
            EngineCmd::ErrorLine { conn, line } => {
                self.send_to_conn(conn, CtrlEvent::Line(line));
                self.send_to_conn(conn, CtrlEvent::Close);
            }
            EngineCmd::AttachFile { path, resp } => {
                let _ = resp.send(self.attach_file(&path));
            }
            EngineCmd::AttachDir { path, resp } => {
                let _ = resp.send(self.attach_dir(&path));
            }
            EngineCmd::AttachMulti { path, resp } => {
                let _ = resp.send(self.attach_multi(&path));
            }
            EngineCmd::AttachLive { path, window, resp } => {
                let _ = resp.send(self.attach_live(&path, window));
            }
            EngineCmd::LiveAppend { root, data, eof } => {
                self.live_append(&root, &data, eof).await;
            }
            EngineCmd::GwMeta {
                root,
                subpath,
                resp,
            } => {
                let _ = resp.send(self.gw_meta(&root, subpath.as_deref()));
            }
            EngineCmd::GwRead {
                root,
                offset,
                len,
                resp,
            } => {
                let _ = resp.send(self.gw_read(&root, offset, len));
            }
            EngineCmd::SpeedInfo { resp } => {
                let _ = resp.send(self.speeds);
            }
            EngineCmd::Shutdown => unreachable!("handled in run"),
        }
    }

    // ── Swarm manager operations ─────────────────────────────────────────

    /// START: parse the url, open or resume the store, dial the tracker.
    async fn start_swarm(&mut self, url: &str, dest: Option<PathBuf>) -> Result<(), String> {
        let url = SwarmUrl::parse(url).map_err(|e| e.to_string())?;
        let dest_dir = dest.unwrap_or_else(|| self.opts.dest_dir.clone());
        let hexroot = swarm_id_hex(&url.root);

        if let Some(swarm) = self.swarms.get_mut(&url.root) {
            // Already running; learn the tracker if new, and repeat PLAY
            // for this (possibly fresh) control client.
            swarm.play_sent = false;
            let dial_addr = match (url.tracker, swarm.tracker) {
                (Some(addr), None) => {
                    swarm.tracker = Some(addr);
                    Some(addr)
                }
                _ => None,
            };
            if let Some(addr) = dial_addr {
                self.dial(url.root, addr).await;
            }
            self.maybe_play(&url.root);
            self.emit_info();
            return Ok(());
        }

        std::fs::create_dir_all(&dest_dir).map_err(|e| e.to_string())?;
        let content_path = dest_dir.join(&hexroot);
        let chunk_size = self.opts.chunk_size;

        let mut swarm = Swarm {
            id: url.root,
            chunk_size,
            status: DlStatus::Downloading,
            dest_dir,
            content_path: content_path.clone(),
            content: SwarmContent::Pending,
            tree: SwarmTree::Leech(Verifier::new(url.root)),
            have: Binmap::new(),
            requested: Binmap::new(),
            channels: Vec::new(),
            tracker: url.tracker,
            live: url.live,
            discard_window: url.discard_window,
            signer: url.live.then(|| LiveSigner::for_swarm(&url.root)),
            signed_peaks: Vec::new(),
            up_bucket: TokenBucket::unlimited(),
            down_bucket: TokenBucket::unlimited(),
            moreinfo: false,
            exact_size: None,
            bytes_up_total: 0,
            bytes_down_total: 0,
            up_speed: 0.0,
            down_speed: 0.0,
            last_accounted: (0, 0),
            play_sent: false,
        };

        // Resume from a checkpoint if the sidecars are here and agree.
        let (mhash_path, mbinmap_path) = sidecar::sidecar_paths(&content_path);
        if !url.live && mbinmap_path.exists() {
            match self.try_resume(&mut swarm, &mhash_path, &mbinmap_path) {
                Ok(true) => tracing::info!(root = hexroot, "resumed from checkpoint"),
                Ok(false) => {}
                Err(e) => tracing::warn!(root = hexroot, error = %e, "resume failed, starting fresh"),
            }
        }
        if url.live {
            swarm.content = SwarmContent::Live(
                LiveStorage::create(&content_path, chunk_size, url.discard_window)
                    .map_err(|e| e.to_string())?,
            );
        }

        tracing::info!(root = hexroot, tracker = ?url.tracker, live = url.live, "swarm started");
        let root = swarm.id;
        self.swarms.insert(root, swarm);
        if let Some(addr) = url.tracker {
            self.dial(root, addr).await;
        }
        self.maybe_play(&root);
        self.emit_info();
        Ok(())
    }

    fn try_resume(
        &self,
        swarm: &mut Swarm,
        mhash_path: &std::path::Path,
        mbinmap_path: &std::path::Path,
    ) -> Result<bool> {
        let record: BinmapRecord = sidecar::read_mbinmap(mbinmap_path)?;
        if record.root != swarm.id || record.chunk_size != swarm.chunk_size {
            return Ok(false);
        }
        // Leaves are indexed by chunk; load up to the highest chunk held.
        let chunks = record
            .have
            .runs()
            .last()
            .map(|r| u64::from(r.end) + 1)
            .unwrap_or(0)
            .max(record.complete_chunks);
        if chunks == 0 {
            return Ok(false);
        }
        let leaves = sidecar::read_mhash_leaves(mhash_path, chunks)?;
        let have_chunks: Vec<u32> = record
            .have
            .runs()
            .flat_map(|r| r.start..=r.end)
            .collect();
        let verifier = Verifier::restore(swarm.id, &leaves, have_chunks.into_iter());
        let complete = verifier.chunk_count() > 0;
        swarm.tree = SwarmTree::Leech(verifier);
        swarm.have = record.have;
        if complete {
            swarm.exact_size = Some(record.complete_bytes);
            swarm.content = SwarmContent::Stored(SwarmStorage::Single(FileStorage::open(
                &swarm.content_path,
                swarm.chunk_size,
            )?));
            swarm.status = DlStatus::Seeding;
        }
        Ok(complete)
    }

    /// REMOVE: close channels, drop the swarm, optionally delete files.
    async fn remove_swarm(&mut self, root: &SwarmId, rm_content: bool, rm_state: bool) {
        let Some(swarm) = self.swarms.remove(root) else {
            return;
        };
        for id in &swarm.channels {
            if let Some(mut channel) = self.channels.remove(id) {
                self.send_close(&mut channel).await;
            }
        }
        let (mhash, mbinmap) = sidecar::sidecar_paths(&swarm.content_path);
        if rm_state {
            let _ = std::fs::remove_file(&mhash);
            let _ = std::fs::remove_file(&mbinmap);
        }
        if rm_content {
            match &swarm.content {
                SwarmContent::Stored(SwarmStorage::Multi(multi)) => {
                    for (rel, _) in multi.spec().entries() {
                        let _ = std::fs::remove_file(multi.base_dir().join(rel));
                    }
                    let _ = std::fs::remove_file(
                        multi.base_dir().join(riptide_store::multifile::SPEC_FILENAME),
                    );
                }
                _ => {
                    let _ = std::fs::remove_file(&swarm.content_path);
                }
            }
        }
        tracing::info!(root = swarm_id_hex(root), rm_content, rm_state, "swarm removed");
    }

    /// CHECKPOINT: flush sidecars via rename-from-temp.
    fn checkpoint_swarm(&mut self, root: &SwarmId) -> Result<()> {
        let Some(swarm) = self.swarms.get(root) else {
            anyhow::bail!("unknown swarm");
        };
        let chunk_count = swarm.tree.chunk_count();
        let mut leaves = Vec::with_capacity(chunk_count as usize);
        for chunk in 0..chunk_count {
            let leaf = match &swarm.tree {
                SwarmTree::Seed(tree) => Some(tree.leaves()[chunk as usize]),
                SwarmTree::Leech(v) => v.trusted_leaf(chunk as u32),
            };
            leaves.push(leaf.unwrap_or(riptide_core::merkle::EMPTY_HASH));
        }
        let (mhash_path, mbinmap_path) = sidecar::sidecar_paths(&swarm.content_path);
        sidecar::write_mhash(&mhash_path, &HashTree::from_leaves(leaves))?;
        sidecar::write_mbinmap(
            &mbinmap_path,
            &BinmapRecord {
                root: *root,
                chunk_size: swarm.chunk_size,
                complete_bytes: swarm.seq_complete(),
                complete_chunks: u64::from(swarm.have.filled_prefix()),
                have: swarm.have.clone(),
            },
        )?;
        tracing::debug!(root = swarm_id_hex(root), "checkpoint written");
        Ok(())
    }

    // ── Attach (seed side) ───────────────────────────────────────────────

    pub(crate) fn attach_file(&mut self, path: &std::path::Path) -> Result<SwarmId> {
        let chunk_size = self.opts.chunk_size;
        let check = hashcheck::attach_file(path, chunk_size)?;
        let chunks = check.tree.chunk_count();
        let mut have = Binmap::new();
        if chunks > 0 {
            have.insert(ChunkRange::new(0, (chunks - 1) as u32));
        }
        let root = check.root;
        let storage = SwarmStorage::Single(FileStorage::open(path, chunk_size)?);
        let swarm = Swarm {
            id: root,
            chunk_size,
            status: DlStatus::Seeding,
            dest_dir: path.parent().unwrap_or(std::path::Path::new(".")).to_path_buf(),
            content_path: path.to_path_buf(),
            content: SwarmContent::Stored(storage),
            tree: SwarmTree::Seed(check.tree),
            have,
            requested: Binmap::new(),
            channels: Vec::new(),
            tracker: None,
            live: false,
            discard_window: None,
            signer: None,
            signed_peaks: Vec::new(),
            up_bucket: TokenBucket::unlimited(),
            down_bucket: TokenBucket::unlimited(),
            moreinfo: false,
            exact_size: Some(check.size),
            bytes_up_total: 0,
            bytes_down_total: 0,
            up_speed: 0.0,
            down_speed: 0.0,
            last_accounted: (0, 0),
            play_sent: false,
        };
        self.swarms.insert(root, swarm);
        self.maybe_play(&root);
        Ok(root)
    }

    fn attach_dir(&mut self, dir: &std::path::Path) -> Result<Vec<SwarmId>> {
        let mut roots = Vec::new();
        for path in hashcheck::seedable_files(dir)? {
            roots.push(self.attach_file(&path)?);
        }
        Ok(roots)
    }

    /// Seed a whole directory as one multi-file swarm.
    fn attach_multi(&mut self, dir: &std::path::Path) -> Result<SwarmId> {
        let chunk_size = self.opts.chunk_size;
        let collection = hashcheck::attach_dir_collection(dir, chunk_size)?;
        let root = collection.check.root;
        let chunks = collection.check.tree.chunk_count();
        let mut have = Binmap::new();
        if chunks > 0 {
            have.insert(ChunkRange::new(0, (chunks - 1) as u32));
        }
        let storage = SwarmStorage::Multi(riptide_store::storage::MultiFileStorage::new(
            dir,
            collection.spec,
            chunk_size,
        )?);
        let swarm = Swarm {
            id: root,
            chunk_size,
            status: DlStatus::Seeding,
            dest_dir: dir.to_path_buf(),
            content_path: dir.join(swarm_id_hex(&root)),
            content: SwarmContent::Stored(storage),
            tree: SwarmTree::Seed(collection.check.tree),
            have,
            requested: Binmap::new(),
            channels: Vec::new(),
            tracker: None,
            live: false,
            discard_window: None,
            signer: None,
            signed_peaks: Vec::new(),
            up_bucket: TokenBucket::unlimited(),
            down_bucket: TokenBucket::unlimited(),
            moreinfo: false,
            exact_size: Some(collection.check.size),
            bytes_up_total: 0,
            bytes_down_total: 0,
            up_speed: 0.0,
            down_speed: 0.0,
            last_accounted: (0, 0),
            play_sent: false,
        };
        self.swarms.insert(root, swarm);
        self.maybe_play(&root);
        Ok(root)
    }

    fn attach_live(&mut self, path: &std::path::Path, window: Option<u64>) -> Result<SwarmId> {
        let chunk_size = self.opts.chunk_size;
        // The live swarm id is derived from the source name; under a real
        // signature scheme it would be the hash of the public key.
        let root: SwarmId =
            riptide_core::merkle::leaf_hash(format!("riptide-live:{}", path.display()).as_bytes());
        let backing = self.opts.dest_dir.join(swarm_id_hex(&root));
        std::fs::create_dir_all(&self.opts.dest_dir)?;
        let live = LiveStorage::create(&backing, chunk_size, window)?;
        let swarm = Swarm {
            id: root,
            chunk_size,
            status: DlStatus::Seeding,
            dest_dir: self.opts.dest_dir.clone(),
            content_path: backing,
            content: SwarmContent::Live(live),
            tree: SwarmTree::Seed(HashTree::new()),
            have: Binmap::new(),
            requested: Binmap::new(),
            channels: Vec::new(),
            tracker: None,
            live: true,
            discard_window: window,
            signer: Some(LiveSigner::for_swarm(&root)),
            signed_peaks: Vec::new(),
            up_bucket: TokenBucket::unlimited(),
            down_bucket: TokenBucket::unlimited(),
            moreinfo: false,
            exact_size: None,
            bytes_up_total: 0,
            bytes_down_total: 0,
            up_speed: 0.0,
            down_speed: 0.0,
            last_accounted: (0, 0),
            play_sent: false,
        };
        self.swarms.insert(root, swarm);
        Ok(root)
    }

    /// Zero-state attach: look for `<dir>/<hexroot>` on first contact.
    pub(crate) fn zerostate_attach(&mut self, root: &SwarmId) -> bool {
        let Some(dir) = self.opts.zerostate_dir.clone() else {
            return false;
        };
        let path = dir.join(swarm_id_hex(root));
        if !path.is_file() {
            return false;
        }
        match self.attach_file(&path) {
            Ok(attached) if attached == *root => true,
            Ok(other) => {
                tracing::warn!(
                    want = swarm_id_hex(root),
                    got = swarm_id_hex(&other),
                    "zero-state file does not match its name"
                );
                self.swarms.remove(&other);
                false
            }
            Err(e) => {
                tracing::warn!(root = swarm_id_hex(root), error = %e, "zero-state attach failed");
                false
            }
        }
    }

    // ── Dialing and closing ──────────────────────────────────────────────

    /// Open a channel to `addr` and send the open handshake (outer channel
    /// id zero, full option block with swarm id).
    pub(crate) async fn dial(&mut self, root: SwarmId, addr: SocketAddr) {
        let already = self
            .channels
            .values()
            .any(|c| c.swarm == root && c.addr == addr && c.state != ChannelState::Closed);
        if already {
            return;
        }
        let id = fresh_channel_id(&self.channels);
        let mut channel = Channel::new(
            id,
            addr,
            root,
            ChannelState::AwaitHandshake,
            DatagramCtx::default(),
        );
        let mut hs = Handshake::new(id);
        hs.swarm_id = Some(root.to_vec());
        let swarm = self.swarms.get_mut(&root);
        if let Some(swarm) = swarm {
            if swarm.live {
                if let Some(w) = swarm.discard_window {
                    hs.live_discard_window = Some(w);
                }
            }
            swarm.channels.push(id);
        }
        let msgs = [Message::Handshake(hs)];
        if let Ok(data) = riptide_core::codec::encode_datagram(&channel.ctx, 0, &msgs) {
            if let Err(e) = self.socket.send_to(&data, addr).await {
                tracing::warn!(%addr, error = %e, "handshake send failed");
            }
            channel.note_send(data.len());
        }
        tracing::debug!(channel = id, %addr, root = swarm_id_hex(&root), "dialing peer");
        self.channels.insert(id, channel);
    }

    /// Send the explicit close record on a channel.
    pub(crate) async fn send_close(&self, channel: &mut Channel) {
        if channel.remote_id == 0 {
            return;
        }
        let msgs = [Message::Handshake(Handshake::close())];
        if let Ok(data) =
            riptide_core::codec::encode_datagram(&channel.ctx, channel.remote_id, &msgs)
        {
            let _ = self.socket.send_to(&data, channel.addr).await;
        }
    }

    /// Drop a channel from both registries.
    pub(crate) async fn close_channel(&mut self, id: u32, reason: &str, explicit: bool) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        channel.state = ChannelState::Closed;
        if explicit {
            self.send_close(&mut channel).await;
        }
        if let Some(swarm) = self.swarms.get_mut(&channel.swarm) {
            swarm.channels.retain(|c| *c != id);
            // Chunks this channel was waiting on become requestable again.
            for (&chunk, _) in channel.outstanding.iter() {
                swarm.requested.remove(ChunkRange::single(chunk));
            }
        }
        tracing::debug!(channel = id, addr = %channel.addr, reason, "channel closed");
    }

    async fn close_all(&mut self) {
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id, "shutdown", true).await;
        }
    }

    // ── Control-plane output ─────────────────────────────────────────────

    pub(crate) fn send_to_conn(&self, conn: ConnId, event: CtrlEvent) {
        if let Some(tx) = self.subscribers.get(&conn) {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn broadcast(&self, event: CtrlEvent) {
        for tx in self.subscribers.values() {
            let _ = tx.send(event.clone());
        }
    }

    /// PLAY once the swarm is servable through the HTTP gateway.
    pub(crate) fn maybe_play(&mut self, root: &SwarmId) {
        let Some(http) = self.opts.http_addr else {
            return;
        };
        let Some(swarm) = self.swarms.get_mut(root) else {
            return;
        };
        if swarm.play_sent {
            return;
        }
        swarm.play_sent = true;
        let line = format!("PLAY {} http://{}/{}", swarm_id_hex(root), http, swarm_id_hex(root));
        self.broadcast(CtrlEvent::Line(line));
    }

    /// Periodic INFO (and MOREINFO) lines, speed accounting, progress.
    fn emit_info(&mut self) {
        let now = Instant::now();
        let (sampled_at, prev_up, prev_down) = self.speed_sample;
        let dt = now.duration_since(sampled_at).as_secs_f64();
        if dt > 0.0 {
            self.speeds = (
                (self.total_down - prev_down) as f64 / dt,
                (self.total_up - prev_up) as f64 / dt,
            );
            self.speed_sample = (now, self.total_up, self.total_down);
        }

        let mut lines = Vec::new();
        for swarm in self.swarms.values_mut() {
            let (up_prev, down_prev) = swarm.last_accounted;
            if dt > 0.0 {
                swarm.up_speed = (swarm.bytes_up_total - up_prev) as f64 / dt;
                swarm.down_speed = (swarm.bytes_down_total - down_prev) as f64 / dt;
                swarm.last_accounted = (swarm.bytes_up_total, swarm.bytes_down_total);
            }
            if swarm.is_complete() && swarm.status == DlStatus::Downloading {
                swarm.status = DlStatus::Seeding;
            }
            let chunk_count = swarm.tree.chunk_count();
            let (mut leeches, mut seeds) = (0usize, 0usize);
            for id in &swarm.channels {
                if let Some(c) = self.channels.get(id) {
                    if c.is_established() {
                        if chunk_count > 0 && c.remote_have.coverage() >= chunk_count {
                            seeds += 1;
                        } else {
                            leeches += 1;
                        }
                    }
                }
            }
            let line = format!(
                "INFO {} {} {}/{} {:.1} {:.1} {leeches} {seeds}",
                swarm_id_hex(&swarm.id),
                swarm.status as u8,
                swarm.seq_complete(),
                swarm.dynasize(),
                swarm.down_speed,
                swarm.up_speed,
            );
            lines.push(line);
            if swarm.moreinfo {
                let stats: Vec<_> = swarm
                    .channels
                    .iter()
                    .filter_map(|id| self.channels.get(id))
                    .map(|c| c.stats())
                    .collect();
                let json = serde_json::json!({
                    "channels": stats,
                    "raw_bytes_up": swarm.bytes_up_total,
                    "raw_bytes_down": swarm.bytes_down_total,
                });
                lines.push(format!("MOREINFO {} {}", swarm_id_hex(&swarm.id), json));
            }
        }
        for line in lines {
            if self.opts.progress && line.starts_with("INFO") {
                println!("{line}");
            }
            self.broadcast(CtrlEvent::Line(line));
        }
    }

    // ── HTTP gateway support ─────────────────────────────────────────────

    fn gw_meta(&self, root: &SwarmId, subpath: Option<&str>) -> Option<GwMeta> {
        let swarm = self.swarms.get(root)?;
        let total = swarm.dynasize();
        match subpath {
            None => Some(GwMeta { total, base: 0 }),
            Some(path) => match &swarm.content {
                SwarmContent::Stored(SwarmStorage::Multi(multi)) => {
                    let (base, len) = multi.spec().file_range(path)?;
                    Some(GwMeta { total: len, base })
                }
                // Shape unknown yet: report empty so the gateway polls.
                SwarmContent::Pending => Some(GwMeta { total: 0, base: 0 }),
                _ => None,
            },
        }
    }

    fn gw_read(&self, root: &SwarmId, offset: u64, len: usize) -> GwRead {
        let Some(swarm) = self.swarms.get(root) else {
            return GwRead::Gone;
        };
        let total = swarm.dynasize();
        if total == 0 {
            return GwRead::Pending;
        }
        if offset >= total {
            return GwRead::Data(Bytes::new());
        }
        let len = len.min((total - offset) as usize);
        let first = (offset / swarm.chunk_size as u64) as u32;
        let last = ((offset + len as u64 - 1) / swarm.chunk_size as u64) as u32;
        if !swarm.have.contains_range(&ChunkRange::new(first, last)) {
            return GwRead::Pending;
        }
        match &swarm.content {
            SwarmContent::Stored(storage) => match storage.read_at(offset, len) {
                Ok(data) => GwRead::Data(data),
                Err(e) => {
                    tracing::warn!(error = %e, "gateway read failed");
                    GwRead::Gone
                }
            },
            SwarmContent::Live(live) => {
                let mut out = Vec::with_capacity(len);
                let mut chunk = first;
                while out.len() < len && chunk <= last {
                    match live.read_chunk(chunk) {
                        Ok(data) => {
                            let skip = if chunk == first {
                                (offset % swarm.chunk_size as u64) as usize
                            } else {
                                0
                            };
                            let room = len - out.len();
                            let slice = &data[skip.min(data.len())..];
                            out.extend_from_slice(&slice[..slice.len().min(room)]);
                        }
                        Err(_) => return GwRead::Gone,
                    }
                    chunk += 1;
                }
                GwRead::Data(Bytes::from(out))
            }
            SwarmContent::Pending => GwRead::Pending,
        }
    }
}
