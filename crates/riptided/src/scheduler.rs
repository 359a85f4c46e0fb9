//! Chunk scheduling — what to REQUEST and what to SEND, per channel.
//!
//! Request picking is sequentially biased (VOD): the lowest missing chunk
//! the remote advertises that no channel is already waiting on. Send
//! picking drains the per-channel queue under the swarm and engine token
//! buckets. Retransmits double their timeout per attempt up to a cap.

use std::time::{Duration, Instant};

use riptide_core::bin::ChunkRange;
use riptide_core::config::TransferConfig;

use crate::channel::{Channel, Outstanding};
use crate::swarm::Swarm;

/// Pick up to `batch` chunks to request on `channel`, registering them as
/// outstanding. Returns the chunks picked (callers compress into ranges).
pub fn pick_requests(
    swarm: &mut Swarm,
    channel: &mut Channel,
    cfg: &TransferConfig,
    now: Instant,
) -> Vec<u32> {
    if !channel.is_established() || channel.choked_by_remote {
        return Vec::new();
    }
    let room = cfg
        .request_batch
        .saturating_sub(channel.outstanding.len());
    if room == 0 {
        return Vec::new();
    }

    // Live swarms chase the moving tail: nothing below the discard floor.
    let floor = match (&swarm.content, swarm.discard_window) {
        (crate::swarm::SwarmContent::Live(_), Some(w)) => {
            let count = swarm.tree.chunk_count();
            count.saturating_sub(w) as u32
        }
        _ => 0,
    };

    let mut picked = Vec::new();
    let mut probe = floor;
    while picked.len() < room {
        // Lowest chunk the remote has that we lack...
        let Some(chunk) = channel.remote_have.first_missing_from(&swarm.have, probe) else {
            break;
        };
        probe = match chunk.checked_add(1) {
            Some(p) => p,
            None => break,
        };
        // ...and that nobody else is waiting on.
        if swarm.requested.contains(chunk) {
            continue;
        }
        swarm.requested.insert(ChunkRange::single(chunk));
        channel.outstanding.insert(
            chunk,
            Outstanding {
                first_requested: now,
                last_sent: now,
                attempts: 1,
            },
        );
        picked.push(chunk);
    }
    picked
}

/// Compress a sorted chunk list into minimal ranges for the wire.
pub fn compress_ranges(chunks: &[u32]) -> Vec<ChunkRange> {
    let mut out: Vec<ChunkRange> = Vec::new();
    for &chunk in chunks {
        match out.last_mut() {
            Some(last) if u64::from(last.end) + 1 == u64::from(chunk) => last.end = chunk,
            _ => out.push(ChunkRange::single(chunk)),
        }
    }
    out
}

/// Outstanding requests whose (doubling) timeout has expired. Bumps the
/// attempt counters; the caller re-emits REQUESTs.
pub fn due_retransmits(channel: &mut Channel, cfg: &TransferConfig, now: Instant) -> Vec<u32> {
    let base = Duration::from_secs(cfg.request_timeout_secs);
    let cap = Duration::from_secs(cfg.request_timeout_max_secs);
    let mut due = Vec::new();
    for (&chunk, req) in channel.outstanding.iter_mut() {
        let timeout = base
            .saturating_mul(1u32 << (req.attempts - 1).min(8))
            .min(cap);
        if now.duration_since(req.last_sent) >= timeout {
            req.last_sent = now;
            req.attempts += 1;
            due.push(chunk);
        }
    }
    due.sort_unstable();
    due
}

/// Chunks sent but never acknowledged within the ACK timeout, still wanted
/// by the remote. They go back on the send queue.
pub fn unacked_resends(channel: &mut Channel, cfg: &TransferConfig, now: Instant) -> Vec<u32> {
    let timeout = Duration::from_secs(cfg.request_timeout_secs);
    let mut resend = Vec::new();
    channel.unacked.retain(|&chunk, sent_at| {
        if now.duration_since(*sent_at) >= timeout {
            resend.push(chunk);
            false
        } else {
            true
        }
    });
    resend.retain(|c| !channel.remote_have.contains(*c));
    resend.sort_unstable();
    resend
}

/// Apply the choke watermarks after queue changes. Returns Some(choke?) if
/// the state flipped and a CHOKE/UNCHOKE record should go out.
pub fn choke_transition(channel: &mut Channel, cfg: &TransferConfig) -> Option<bool> {
    let depth = channel.pending_sends.len();
    if !channel.choked_by_us && depth > cfg.choke_high {
        channel.choked_by_us = true;
        return Some(true);
    }
    if channel.choked_by_us && depth < cfg.choke_low {
        channel.choked_by_us = false;
        return Some(false);
    }
    None
}
