//! Outbound scheduling: the periodic tick that picks requests, serves
//! queued chunks under the token buckets, retransmits, and keeps channels
//! alive. Serving a chunk plans the integrity records the remote still
//! needs: missing peaks smallest-first, then the uncle chain bottom-up,
//! then the DATA itself.

use std::time::{Duration, Instant};

use riptide_core::bin::ChunkRange;
use riptide_core::codec::{encode_datagram, Message};
use riptide_core::wire::ChunkAddressing;
use riptide_core::{swarm_id_hex, SwarmId};

use crate::channel::Channel;
use crate::scheduler;
use crate::swarm::{SwarmContent, SwarmTree};

use super::{now_micros, CtrlEvent, Engine};

/// Upper bound on DATA records emitted per channel per tick.
const SENDS_PER_TICK: usize = 64;

impl Engine {
    /// One scheduler pass over every channel.
    pub(crate) async fn on_tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in ids {
            let Some(mut channel) = self.channels.remove(&id) else {
                continue;
            };

            // Dead peer: no bytes received for too long.
            let dead = Duration::from_secs(self.opts.transfer.dead_secs);
            if now.duration_since(channel.last_recv) >= dead {
                self.channels.insert(id, channel);
                self.close_channel(id, "peer idle", true).await;
                continue;
            }

            if channel.is_established() {
                self.request_pass(&mut channel, now).await;
                self.serve_pass(&mut channel, now, SENDS_PER_TICK).await;
            } else if now.duration_since(channel.last_send) >= Duration::from_secs(1) {
                // The open handshake may have been lost; repeat it.
                let mut hs = riptide_core::codec::Handshake::new(channel.id);
                hs.swarm_id = Some(channel.swarm.to_vec());
                let msgs = [Message::Handshake(hs)];
                if let Ok(data) = encode_datagram(&channel.ctx, 0, &msgs) {
                    if self.socket.send_to(&data, channel.addr).await.is_ok() {
                        channel.note_send(data.len());
                    }
                }
            }

            // Keepalive: an empty datagram holds the channel open.
            let keep = Duration::from_secs(self.opts.transfer.keepalive_secs);
            if now.duration_since(channel.last_send) >= keep {
                self.send_msgs(&mut channel, &[]).await;
            }

            self.channels.insert(id, channel);
        }
    }

    /// Emit new REQUESTs and due retransmits for a downloading channel.
    pub(crate) async fn request_pass(&mut self, channel: &mut Channel, now: Instant) {
        let cfg = self.opts.transfer.clone();
        let mut chunks = Vec::new();
        if !channel.choked_by_remote {
            chunks.extend(scheduler::due_retransmits(channel, &cfg, now));
            if let Some(swarm) = self.swarms.get_mut(&channel.swarm) {
                chunks.extend(scheduler::pick_requests(swarm, channel, &cfg, now));
            }
        }
        if chunks.is_empty() {
            return;
        }
        chunks.sort_unstable();
        chunks.dedup();
        let mut msgs = Vec::new();
        for range in scheduler::compress_ranges(&chunks) {
            for part in split_for(channel.ctx.addressing, range) {
                msgs.push(Message::Request(part));
            }
        }
        self.send_msgs(channel, &msgs).await;
    }

    /// Serve queued REQUESTs under the rate limits; re-queue unacked DATA
    /// that timed out. `budget` caps DATA records this pass: the inline
    /// pass after a REQUEST sends one so a trailing CANCEL still has a
    /// queue to prune; the tick drains the rest.
    pub(crate) async fn serve_pass(&mut self, channel: &mut Channel, now: Instant, budget: usize) {
        let cfg = self.opts.transfer.clone();
        for chunk in scheduler::unacked_resends(channel, &cfg, now) {
            channel.enqueue_send(chunk);
        }

        let mut sent = 0;
        while sent < budget {
            let Some(&chunk) = channel.pending_sends.front() else {
                break;
            };
            let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
                break;
            };
            let Some(len) = swarm.chunk_len(chunk) else {
                channel.pending_sends.pop_front();
                continue;
            };
            // Both buckets must admit the chunk; try again next tick if not.
            if !swarm.up_bucket.take(len, now) || !self.global_up.take(len, now) {
                break;
            }
            channel.pending_sends.pop_front();
            self.serve_chunk(channel, chunk).await;
            sent += 1;
        }

        if let Some(choke) = scheduler::choke_transition(channel, &cfg) {
            let msg = if choke { Message::Choke } else { Message::Unchoke };
            self.send_msgs(channel, &[msg]).await;
        }
    }

    /// Send one chunk with every integrity record the remote still needs.
    async fn serve_chunk(&mut self, channel: &mut Channel, chunk: u32) {
        let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
            return;
        };
        let payload = match &swarm.content {
            SwarmContent::Stored(storage) => storage.read_chunk(chunk),
            SwarmContent::Live(live) => live.read_chunk(chunk),
            SwarmContent::Pending => return,
        };
        let payload = match payload {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(chunk, error = %e, "cannot serve chunk");
                return;
            }
        };

        let mut msgs = Vec::new();
        let mut planned: Vec<ChunkRange> = Vec::new();
        if swarm.live {
            Self::plan_signed_peaks(swarm, channel, &mut msgs);
        } else {
            // Peaks only exist on the wire when there is more than one;
            // a lone peak IS the root the remote already trusts.
            let peaks = swarm.tree.peak_hashes();
            if peaks.len() > 1 {
                for (range, hash) in peaks.iter().rev() {
                    if !channel.hashes_out.contains(range) {
                        planned.push(*range);
                        msgs.push(Message::Integrity {
                            range: *range,
                            hash: hash.to_vec(),
                        });
                    }
                }
            }
        }

        let count = swarm.tree.chunk_count();
        for range in riptide_core::merkle::uncles(chunk, count) {
            if channel.hashes_out.contains(&range) {
                continue;
            }
            match swarm.tree.hash_for(&range) {
                Some(hash) => {
                    planned.push(range);
                    msgs.push(Message::Integrity {
                        range,
                        hash: hash.to_vec(),
                    });
                }
                None => {
                    // Partial downloader asked for a chunk whose proof it
                    // cannot get from us yet.
                    tracing::debug!(chunk, ?range, "uncle hash unavailable, not serving");
                    return;
                }
            }
        }
        channel.hashes_out.extend(planned);
        channel.hashes_out.insert(ChunkRange::single(chunk));

        let len = payload.len();
        msgs.push(Message::Data {
            range: ChunkRange::single(chunk),
            timestamp: now_micros(),
            payload,
        });
        swarm.bytes_up_total += len as u64;
        channel.chunks_up += 1;
        channel.unacked.insert(chunk, Instant::now());
        self.send_msgs(channel, &msgs).await;
    }

    /// Plan INTEGRITY + SIGNED_INTEGRITY for every signed peak this peer
    /// has not seen yet. Lower peaks first, mirroring the static order.
    fn plan_signed_peaks(
        swarm: &mut crate::swarm::Swarm,
        channel: &mut Channel,
        msgs: &mut Vec<Message>,
    ) {
        let mut peaks = swarm.signed_peaks.clone();
        peaks.sort_by_key(|(r, _, _, _)| std::cmp::Reverse(r.start));
        for (range, hash, timestamp, signature) in peaks {
            if !channel.signed_out.insert(range) {
                continue;
            }
            channel.hashes_out.insert(range);
            msgs.push(Message::Integrity {
                range,
                hash: hash.to_vec(),
            });
            msgs.push(Message::SignedIntegrity {
                range,
                timestamp,
                signature,
            });
        }
    }

    /// Announcements owed to a newly established channel: the signed peak
    /// picture (live) and our full HAVE set, compressed to runs.
    pub(crate) fn append_announcements(&mut self, channel: &mut Channel, out: &mut Vec<Message>) {
        let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
            return;
        };
        if swarm.live {
            Self::plan_signed_peaks(swarm, channel, out);
        }
        let runs: Vec<ChunkRange> = swarm.have.runs().collect();
        for run in runs {
            for part in split_for(channel.ctx.addressing, run) {
                out.push(Message::Have(Some(part)));
            }
        }
    }

    /// Tell every other established channel of the swarm about a new chunk.
    pub(crate) async fn advertise_have(
        &mut self,
        swarm_id: SwarmId,
        exclude: u32,
        range: ChunkRange,
    ) {
        let Some(swarm) = self.swarms.get(&swarm_id) else {
            return;
        };
        let ids: Vec<u32> = swarm
            .channels
            .iter()
            .copied()
            .filter(|id| *id != exclude)
            .collect();
        // Live rule: a HAVE must ride behind the signed peak covering it.
        let live = swarm.live;
        for id in ids {
            let Some(mut peer) = self.channels.remove(&id) else {
                continue;
            };
            if peer.is_established() {
                let mut msgs = Vec::new();
                if live {
                    if let Some(swarm) = self.swarms.get_mut(&swarm_id) {
                        Self::plan_signed_peaks(swarm, &mut peer, &mut msgs);
                    }
                }
                for part in split_for(peer.ctx.addressing, range) {
                    msgs.push(Message::Have(Some(part)));
                }
                self.send_msgs(&mut peer, &msgs).await;
            }
            self.channels.insert(id, peer);
        }
    }

    /// Live source input: append to the log, extend the tree, re-sign the
    /// peak set, and announce the new chunks everywhere.
    pub(crate) async fn live_append(&mut self, root: &SwarmId, data: &[u8], eof: bool) {
        let Some(swarm) = self.swarms.get_mut(root) else {
            return;
        };
        let SwarmContent::Live(live) = &mut swarm.content else {
            return;
        };
        let mut completed = match live.append(data) {
            Ok(chunks) => chunks,
            Err(e) => {
                let line = format!("ERROR {} {e}", swarm_id_hex(root));
                self.broadcast(CtrlEvent::Line(line));
                return;
            }
        };
        if eof {
            completed.extend(live.flush_tail());
            swarm.exact_size = Some(live.size());
        }
        if completed.is_empty() {
            return;
        }

        // Extend the tree and have set.
        let (first, last) = (completed[0], *completed.last().expect("nonempty"));
        let SwarmContent::Live(live) = &swarm.content else {
            unreachable!()
        };
        let mut leaf_hashes = Vec::new();
        for chunk in &completed {
            if let Ok(data) = live.read_chunk(*chunk) {
                leaf_hashes.push(riptide_core::merkle::leaf_hash(&data));
            }
        }
        let SwarmTree::Seed(tree) = &mut swarm.tree else {
            return;
        };
        for hash in leaf_hashes {
            tree.push_leaf(hash);
        }
        swarm.have.insert(ChunkRange::new(first, last));

        // Re-sign the changed peak set.
        if let Some(signer) = &swarm.signer {
            let timestamp = now_micros();
            let SwarmTree::Seed(tree) = &swarm.tree else {
                unreachable!()
            };
            swarm.signed_peaks = tree
                .peak_hashes()
                .into_iter()
                .map(|(range, hash)| {
                    let sig = signer.sign(&range, &hash, timestamp);
                    (range, hash, timestamp, sig)
                })
                .collect();
        }
        // Fresh peaks must reach peers before (or with) the HAVE.
        for id in self
            .swarms
            .get(root)
            .map(|s| s.channels.clone())
            .unwrap_or_default()
        {
            if let Some(mut peer) = self.channels.remove(&id) {
                // New signatures supersede whatever was sent before.
                peer.signed_out.clear();
                self.channels.insert(id, peer);
            }
        }
        self.advertise_have(*root, 0, ChunkRange::new(first, last))
            .await;
    }

    /// Encode and transmit one datagram on a channel.
    pub(crate) async fn send_msgs(&mut self, channel: &mut Channel, msgs: &[Message]) {
        match encode_datagram(&channel.ctx, channel.remote_id, msgs) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, channel.addr).await {
                    tracing::debug!(channel = channel.id, error = %e, "send failed");
                    return;
                }
                channel.note_send(data.len());
                self.total_up += data.len() as u64;
            }
            Err(e) => {
                tracing::warn!(channel = channel.id, error = %e, "datagram encode failed");
            }
        }
    }
}

/// Split a range for the channel's addressing: bin-addressed peers only
/// understand aligned subtrees.
fn split_for(addressing: ChunkAddressing, range: ChunkRange) -> Vec<ChunkRange> {
    match addressing {
        ChunkAddressing::ChunkRange32 => vec![range],
        ChunkAddressing::Bin32 => range
            .to_bins()
            .into_iter()
            .filter_map(ChunkRange::from_bin)
            .collect(),
    }
}
