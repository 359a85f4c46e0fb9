//! Inbound datagram handling: channel dispatch, handshakes, and per-record
//! processing. Records within one datagram are processed in arrival order;
//! a HANDSHAKE always lands first because open-handshake datagrams are
//! parsed on the zero channel.

use std::net::SocketAddr;

use bytes::Bytes;

use riptide_core::bin::ChunkRange;
use riptide_core::codec::{
    decode_datagram, decode_legacy_handshake, DatagramCtx, Handshake, Message,
};
use riptide_core::merkle::TreeError;
use riptide_core::wire::{
    ChunkAddressing, CHANNEL_TUNNEL, INTEGRITY_FAIL_LIMIT, RECV_ERROR_LIMIT,
};
use riptide_core::{swarm_id_hex, SwarmId};
use riptide_store::storage::SwarmStorage;

use crate::channel::{Channel, ChannelState};
use crate::swarm::{SwarmContent, SwarmTree};

use super::{CtrlEvent, Engine};

impl Engine {
    pub(crate) async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if data.len() < 4 {
            return;
        }
        let channel_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

        if channel_id == CHANNEL_TUNNEL {
            self.handle_tunnel(&data[4..], from);
            return;
        }
        if channel_id == 0 {
            self.handle_open_datagram(data, from).await;
            return;
        }
        self.handle_channel_datagram(channel_id, data, from).await;
    }

    fn handle_tunnel(&mut self, payload: &[u8], from: SocketAddr) {
        let line = format!("TUNNELRECV {from}/ffffffff {}", payload.len());
        tracing::debug!(%from, len = payload.len(), "tunnel datagram in");
        self.broadcast(CtrlEvent::Line(line));
        self.broadcast(CtrlEvent::Packet(Bytes::copy_from_slice(payload)));
    }

    /// Datagram on the zero channel: an open handshake (possibly legacy),
    /// or an explicit close from a peer that lost our channel id.
    async fn handle_open_datagram(&mut self, data: &[u8], from: SocketAddr) {
        for addressing in [ChunkAddressing::ChunkRange32, ChunkAddressing::Bin32] {
            let ctx = DatagramCtx {
                addressing,
                ..DatagramCtx::default()
            };
            if let Ok((_, msgs)) = decode_datagram(&ctx, data) {
                if let Some(Message::Handshake(hs)) = msgs.first() {
                    if hs.is_close() {
                        self.close_by_addr(from).await;
                        return;
                    }
                    let hs = hs.clone();
                    self.accept_handshake(hs, &msgs[1..], from).await;
                    return;
                }
            }
        }
        // Pre-versioned shape: INTEGRITY(all, swarm id) then HANDSHAKE.
        if let Some((swarm_id, remote_chan)) = decode_legacy_handshake(&data[4..]) {
            if let Ok(root) = <SwarmId>::try_from(swarm_id.as_slice()) {
                let mut hs = Handshake::new(remote_chan);
                hs.swarm_id = Some(root.to_vec());
                hs.chunk_addressing = ChunkAddressing::Bin32;
                self.accept_handshake(hs, &[], from).await;
                return;
            }
        }
        tracing::debug!(%from, "undecodable datagram on channel zero");
    }

    async fn close_by_addr(&mut self, from: SocketAddr) {
        let ids: Vec<u32> = self
            .channels
            .values()
            .filter(|c| c.addr == from)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.close_channel(id, "remote close", false).await;
        }
    }

    /// Respond to an open handshake: match the swarm, allocate a channel,
    /// reply with our handshake plus the full HAVE picture.
    async fn accept_handshake(&mut self, hs: Handshake, rest: &[Message], from: SocketAddr) {
        let Some(swarm_id) = hs.swarm_id.as_deref().and_then(|id| SwarmId::try_from(id).ok())
        else {
            tracing::debug!(%from, "open handshake without swarm id");
            return;
        };
        if !self.swarms.contains_key(&swarm_id) && !self.zerostate_attach(&swarm_id) {
            tracing::debug!(%from, root = swarm_id_hex(&swarm_id), "handshake for unknown swarm");
            return;
        }

        // A retransmitted open handshake reuses the existing channel.
        let existing = self
            .channels
            .values()
            .find(|c| c.swarm == swarm_id && c.addr == from)
            .map(|c| c.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = crate::channel::fresh_channel_id(&self.channels);
                let ctx = DatagramCtx {
                    addressing: hs.chunk_addressing,
                    ..DatagramCtx::default()
                };
                let channel = Channel::new(id, from, swarm_id, ChannelState::Established, ctx);
                self.channels.insert(id, channel);
                if let Some(swarm) = self.swarms.get_mut(&swarm_id) {
                    swarm.channels.push(id);
                }
                id
            }
        };

        let mut channel = self.channels.remove(&id).expect("channel just ensured");
        channel.remote_id = hs.channel;
        channel.state = ChannelState::Established;
        channel.note_recv(0);

        // Reply: our handshake (swarm already matched, no id needed), the
        // signed peak picture for live swarms, then our HAVE runs.
        let mut our_hs = Handshake::new(id);
        our_hs.chunk_addressing = channel.ctx.addressing;
        let mut reply = vec![Message::Handshake(our_hs)];
        self.append_announcements(&mut channel, &mut reply);
        self.send_msgs(&mut channel, &reply).await;

        for msg in rest {
            self.process_message(&mut channel, msg.clone()).await;
        }
        let closed = channel.state == ChannelState::Closed;
        self.channels.insert(id, channel);
        if closed {
            self.close_channel(id, "closed during handshake", true).await;
        } else {
            tracing::debug!(channel = id, %from, root = swarm_id_hex(&swarm_id), "responder established");
        }
    }

    /// Datagram addressed to one of our channels.
    async fn handle_channel_datagram(&mut self, channel_id: u32, data: &[u8], from: SocketAddr) {
        let Some(mut channel) = self.channels.remove(&channel_id) else {
            tracing::debug!(channel = channel_id, %from, "datagram for unknown channel");
            return;
        };
        let msgs = match decode_datagram(&channel.ctx, data) {
            Ok((_, msgs)) => msgs,
            Err(e) => {
                channel.recv_errors += 1;
                tracing::debug!(
                    channel = channel_id,
                    error = %e,
                    count = channel.recv_errors,
                    "datagram discarded"
                );
                if channel.is_established() && channel.recv_errors >= RECV_ERROR_LIMIT {
                    self.channels.insert(channel_id, channel);
                    self.close_channel(channel_id, "repeated parse errors", true)
                        .await;
                } else {
                    self.channels.insert(channel_id, channel);
                }
                return;
            }
        };
        channel.note_recv(data.len());
        self.total_down += data.len() as u64;

        let mut closed = false;
        for msg in msgs {
            if matches!(&msg, Message::Handshake(hs) if hs.is_close()) {
                closed = true;
                break;
            }
            self.process_message(&mut channel, msg).await;
            if channel.state == ChannelState::Closed {
                closed = true;
                break;
            }
        }
        if closed {
            self.channels.insert(channel_id, channel);
            self.close_channel(channel_id, "closed by peer", false).await;
        } else {
            self.channels.insert(channel_id, channel);
        }
    }

    /// One protocol record on an established (or establishing) channel.
    pub(crate) async fn process_message(&mut self, channel: &mut Channel, msg: Message) {
        match msg {
            Message::Handshake(hs) => {
                if channel.state == ChannelState::AwaitHandshake {
                    channel.remote_id = hs.channel;
                    channel.state = ChannelState::Established;
                    let mut reply = Vec::new();
                    self.append_announcements(channel, &mut reply);
                    if !reply.is_empty() {
                        self.send_msgs(channel, &reply).await;
                    }
                    tracing::debug!(channel = channel.id, addr = %channel.addr, "initiator established");
                }
            }
            Message::Have(range) => {
                if let Some(range) = range {
                    channel.remote_have.insert(range);
                }
            }
            Message::Request(range) => self.on_request(channel, range).await,
            Message::Cancel(range) => channel.cancel_sends(&range),
            Message::Data {
                range,
                timestamp,
                payload,
            } => self.on_data(channel, range, timestamp, payload).await,
            Message::Ack { range, .. } => {
                channel.unacked.retain(|chunk, _| !range.contains(*chunk));
            }
            Message::Integrity { range, hash } => {
                if let Ok(hash) = <[u8; 20]>::try_from(hash.as_slice()) {
                    if let Some(swarm) = self.swarms.get_mut(&channel.swarm) {
                        if let SwarmTree::Leech(v) = &mut swarm.tree {
                            v.add_integrity(range, hash);
                        }
                    }
                    self.ensure_leech_storage(&channel.swarm);
                }
            }
            Message::SignedIntegrity {
                range,
                timestamp,
                signature,
            } => self.on_signed_integrity(channel, range, timestamp, signature),
            Message::Choke => {
                channel.choked_by_remote = true;
            }
            Message::Unchoke => {
                channel.choked_by_remote = false;
            }
            Message::PexReq => self.on_pex_req(channel).await,
            Message::PexResV4(addr) => {
                self.on_pex_res(channel.swarm, SocketAddr::V4(addr)).await;
            }
            Message::PexResV6(addr) => {
                self.on_pex_res(channel.swarm, SocketAddr::V6(addr)).await;
            }
            Message::PexResCert(_) => {
                // Certified PEX is parsed but carries nothing we act on.
            }
        }
    }

    /// Inbound REQUEST: queue every requested chunk we can serve.
    async fn on_request(&mut self, channel: &mut Channel, range: ChunkRange) {
        if !channel.is_established() || channel.choked_by_us {
            return;
        }
        let Some(swarm) = self.swarms.get(&channel.swarm) else {
            return;
        };
        let count = swarm.tree.chunk_count();
        let end = if count > 0 {
            range.end.min((count - 1) as u32)
        } else {
            return;
        };
        for chunk in range.start..=end {
            if swarm.have.contains(chunk) {
                channel.enqueue_send(chunk);
            }
        }
        if let Some(choke) = crate::scheduler::choke_transition(channel, &self.opts.transfer) {
            let msg = if choke { Message::Choke } else { Message::Unchoke };
            self.send_msgs(channel, &[msg]).await;
        }
        // Serve one chunk straight away; the rest waits a tick so a CANCEL
        // right behind the REQUEST can still be honored.
        self.serve_pass(channel, std::time::Instant::now(), 1).await;
    }

    /// Inbound DATA: verify against the tree, commit to the store, ACK,
    /// and advertise the new chunk on every other channel of the swarm.
    async fn on_data(
        &mut self,
        channel: &mut Channel,
        range: ChunkRange,
        timestamp: u64,
        payload: Bytes,
    ) {
        let chunk = range.start;
        let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
            return;
        };
        if swarm.have.contains(chunk) {
            // Duplicate delivery; ACK so the sender stops resending.
            let ack = Message::Ack { range, timestamp };
            self.send_msgs(channel, &[ack]).await;
            return;
        }

        let verdict = match &mut swarm.tree {
            SwarmTree::Leech(v) => v.verify_chunk(chunk, &payload),
            // A seed getting DATA is a protocol oddity; drop it.
            SwarmTree::Seed(_) => return,
        };
        if let Err(e) = verdict {
            // The chunk stays requestable from another channel.
            swarm.requested.remove(ChunkRange::single(chunk));
            channel.clear_outstanding(&ChunkRange::single(chunk));
            // A missing hash is our gap, not the peer's lie.
            if !matches!(e, TreeError::MissingHash(_)) {
                channel.integrity_fails += 1;
            }
            tracing::warn!(
                channel = channel.id,
                chunk,
                error = %e,
                fails = channel.integrity_fails,
                "integrity failure"
            );
            if channel.integrity_fails >= INTEGRITY_FAIL_LIMIT {
                channel.state = ChannelState::Closed;
            }
            return;
        }

        self.ensure_leech_storage(&channel.swarm);
        let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
            return;
        };

        // A short payload on the final chunk pins the exact byte size.
        let count = swarm.tree.chunk_count();
        if payload.len() < swarm.chunk_size
            && u64::from(chunk) + 1 == count
            && swarm.exact_size.is_none()
        {
            let exact = u64::from(chunk) * swarm.chunk_size as u64 + payload.len() as u64;
            swarm.exact_size = Some(exact);
            if let SwarmContent::Stored(SwarmStorage::Single(file)) = &mut swarm.content {
                if let Err(e) = file.truncate_to(exact) {
                    tracing::warn!(error = %e, "failed to trim content to exact size");
                }
            }
        }

        let write = match &mut swarm.content {
            SwarmContent::Stored(storage) => storage.write_chunk(chunk, &payload),
            SwarmContent::Live(live) => live.insert_chunk(chunk, payload.clone()),
            SwarmContent::Pending => {
                tracing::warn!(chunk, "verified chunk with no storage; dropped");
                return;
            }
        };
        if let Err(e) = write {
            swarm.status = crate::swarm::DlStatus::StoppedOnError;
            let line = format!("ERROR {} {e}", swarm_id_hex(&swarm.id));
            self.broadcast(CtrlEvent::Line(line));
            return;
        }

        swarm.have.insert(ChunkRange::single(chunk));
        swarm.requested.remove(ChunkRange::single(chunk));
        swarm.bytes_down_total += payload.len() as u64;
        channel.chunks_down += 1;
        channel.clear_outstanding(&ChunkRange::single(chunk));

        // Multi-file swarms reveal their shape in the first chunks.
        self.maybe_convert_multifile(&channel.swarm);

        let ack = Message::Ack { range, timestamp };
        self.send_msgs(channel, &[ack]).await;
        self.advertise_have(channel.swarm, channel.id, ChunkRange::single(chunk))
            .await;
        // Keep the pipeline self-clocking: replace the finished request
        // right away instead of waiting for the next tick.
        self.request_pass(channel, std::time::Instant::now()).await;
    }

    fn on_signed_integrity(
        &mut self,
        channel: &mut Channel,
        range: ChunkRange,
        timestamp: u64,
        signature: Vec<u8>,
    ) {
        let Some(swarm) = self.swarms.get_mut(&channel.swarm) else {
            return;
        };
        let Some(signer) = &swarm.signer else {
            return;
        };
        let SwarmTree::Leech(v) = &mut swarm.tree else {
            return;
        };
        // The peak hash rides in an INTEGRITY record of the same datagram.
        let Some(hash) = v.pending_hash(&range) else {
            tracing::debug!(?range, "signed peak without its hash");
            return;
        };
        if !signer.verify(&range, &hash, timestamp, &signature) {
            channel.integrity_fails += 1;
            tracing::warn!(channel = channel.id, ?range, "bad live peak signature");
            if channel.integrity_fails >= INTEGRITY_FAIL_LIMIT {
                channel.state = ChannelState::Closed;
            }
            return;
        }
        v.accept_signed_peak(range, hash);
        swarm
            .signed_peaks
            .retain(|(r, _, _, _)| !range.contains_range(r));
        swarm.signed_peaks.push((range, hash, timestamp, signature));
        self.ensure_leech_storage(&channel.swarm);
    }

    async fn on_pex_req(&mut self, channel: &mut Channel) {
        let Some(swarm) = self.swarms.get(&channel.swarm) else {
            return;
        };
        let mut msgs = Vec::new();
        for id in &swarm.channels {
            if *id == channel.id || msgs.len() >= self.opts.transfer.pex_max_peers {
                continue;
            }
            let Some(peer) = self.channels.get(id) else {
                continue;
            };
            if !peer.is_established() {
                continue;
            }
            msgs.push(match peer.addr {
                SocketAddr::V4(a) => Message::PexResV4(a),
                SocketAddr::V6(a) => Message::PexResV6(a),
            });
        }
        if !msgs.is_empty() {
            self.send_msgs(channel, &msgs).await;
        }
    }

    /// PEX response on an established channel: connect if the address is
    /// new for this swarm.
    async fn on_pex_res(&mut self, swarm_id: SwarmId, addr: SocketAddr) {
        if !self.swarms.contains_key(&swarm_id) {
            return;
        }
        self.dial(swarm_id, addr).await;
    }

    /// Create download storage once the chunk count is known.
    pub(crate) fn ensure_leech_storage(&mut self, root: &SwarmId) {
        let Some(swarm) = self.swarms.get_mut(root) else {
            return;
        };
        if !matches!(swarm.content, SwarmContent::Pending) {
            return;
        }
        let count = swarm.tree.chunk_count();
        if count == 0 {
            return;
        }
        let size = count * swarm.chunk_size as u64;
        match SwarmStorage::create_download(&swarm.content_path, size, swarm.chunk_size) {
            Ok(storage) => {
                swarm.content = SwarmContent::Stored(storage);
                tracing::debug!(
                    root = swarm_id_hex(root),
                    chunks = count,
                    "download storage allocated"
                );
                self.maybe_play(root);
            }
            Err(e) => {
                swarm.status = crate::swarm::DlStatus::StoppedOnError;
                let line = format!("ERROR {} {e}", swarm_id_hex(root));
                self.broadcast(CtrlEvent::Line(line));
            }
        }
    }

    /// Convert to multi-file once every chunk covering the spec is here.
    fn maybe_convert_multifile(&mut self, root: &SwarmId) {
        let Some(swarm) = self.swarms.get_mut(root) else {
            return;
        };
        let SwarmContent::Stored(storage) = &mut swarm.content else {
            return;
        };
        let Some(declared) = storage.spec_declared_size() else {
            return;
        };
        if declared == 0 {
            return;
        }
        let last_spec_chunk = ((declared - 1) / swarm.chunk_size as u64) as u32;
        if !swarm
            .have
            .contains_range(&ChunkRange::new(0, last_spec_chunk))
        {
            return;
        }
        match storage.convert_multifile() {
            Ok(true) => tracing::info!(root = swarm_id_hex(root), "multi-file layout detected"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "multi-file conversion failed"),
        }
    }
}
