//! Per-peer channel state.
//!
//! One channel per (local swarm, remote address). The channel owns the
//! conversation state: handshake lifecycle, what the remote HAS, what it
//! asked us for, what we asked it for, which hashes it already holds, and
//! the timers and counters that keep the conversation honest. Channels are
//! registered by id; swarm and channel reference each other through ids
//! only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use riptide_core::bin::ChunkRange;
use riptide_core::binmap::Binmap;
use riptide_core::codec::DatagramCtx;
use riptide_core::SwarmId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// We sent our open handshake and wait for theirs.
    AwaitHandshake,
    Established,
    Closed,
}

/// One outgoing request we are still waiting on.
#[derive(Debug, Clone)]
pub struct Outstanding {
    pub first_requested: Instant,
    pub last_sent: Instant,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Channel {
    /// Our channel id: what the remote puts on datagrams to us.
    pub id: u32,
    /// The remote's channel id: what we put on datagrams to them.
    pub remote_id: u32,
    pub addr: SocketAddr,
    pub swarm: SwarmId,
    pub state: ChannelState,
    pub ctx: DatagramCtx,
    /// Chunks the remote advertises.
    pub remote_have: Binmap,
    /// Tree ranges whose hashes the remote holds (sent by us, or implied).
    pub hashes_out: HashSet<ChunkRange>,
    /// Signed peak ranges already delivered to this peer.
    pub signed_out: HashSet<ChunkRange>,
    /// Our requests to them, per chunk.
    pub outstanding: HashMap<u32, Outstanding>,
    /// Their requests to us, not yet served or cancelled.
    pub pending_sends: VecDeque<u32>,
    /// Chunks we sent and they have not acknowledged.
    pub unacked: HashMap<u32, Instant>,
    pub choked_by_us: bool,
    pub choked_by_remote: bool,
    pub last_send: Instant,
    pub last_recv: Instant,
    /// Consecutive datagrams discarded for parse errors.
    pub recv_errors: u32,
    pub integrity_fails: u32,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub chunks_up: u64,
    pub chunks_down: u64,
}

impl Channel {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        swarm: SwarmId,
        state: ChannelState,
        ctx: DatagramCtx,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote_id: 0,
            addr,
            swarm,
            state,
            ctx,
            remote_have: Binmap::new(),
            hashes_out: HashSet::new(),
            signed_out: HashSet::new(),
            outstanding: HashMap::new(),
            pending_sends: VecDeque::new(),
            unacked: HashMap::new(),
            choked_by_us: false,
            choked_by_remote: false,
            last_send: now,
            last_recv: now,
            recv_errors: 0,
            integrity_fails: 0,
            bytes_up: 0,
            bytes_down: 0,
            chunks_up: 0,
            chunks_down: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }

    pub fn note_send(&mut self, bytes: usize) {
        self.last_send = Instant::now();
        self.bytes_up += bytes as u64;
    }

    pub fn note_recv(&mut self, bytes: usize) {
        self.last_recv = Instant::now();
        self.recv_errors = 0;
        self.bytes_down += bytes as u64;
    }

    /// Queue a requested chunk for serving unless already queued.
    pub fn enqueue_send(&mut self, chunk: u32) {
        if !self.pending_sends.contains(&chunk) {
            self.pending_sends.push_back(chunk);
        }
    }

    /// Honor a CANCEL: drop queued (not yet emitted) chunks in `range`.
    pub fn cancel_sends(&mut self, range: &ChunkRange) {
        self.pending_sends.retain(|c| !range.contains(*c));
    }

    /// Forget outstanding requests in `range` (their DATA arrived or was
    /// cancelled); returns the affected chunks.
    pub fn clear_outstanding(&mut self, range: &ChunkRange) -> Vec<u32> {
        let cleared: Vec<u32> = self
            .outstanding
            .keys()
            .copied()
            .filter(|c| range.contains(*c))
            .collect();
        for chunk in &cleared {
            self.outstanding.remove(chunk);
        }
        cleared
    }

    /// Per-channel statistics for MOREINFO lines.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            ip: self.addr.ip().to_string(),
            port: self.addr.port(),
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            chunks_up: self.chunks_up,
            chunks_down: self.chunks_down,
            outstanding: self.outstanding.len(),
            queued: self.pending_sends.len(),
            choked: self.choked_by_us,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelStats {
    pub ip: String,
    pub port: u16,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub chunks_up: u64,
    pub chunks_down: u64,
    pub outstanding: usize,
    pub queued: usize,
    pub choked: bool,
}

/// Draw a channel id that is neither the zero sentinel nor the tunnel id
/// nor already taken.
pub fn fresh_channel_id(taken: &HashMap<u32, Channel>) -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != 0 && id != riptide_core::wire::CHANNEL_TUNNEL && !taken.contains_key(&id) {
            return id;
        }
    }
}
