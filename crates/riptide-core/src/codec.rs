//! Datagram codec — one tagged variant across all record kinds, plus pure
//! encode/decode over a byte cursor.
//!
//! Decoding needs per-channel context: the negotiated chunk addressing and
//! the hash/signature lengths fixed by the swarm's integrity options. A
//! decode error discards the whole datagram; the caller counts it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bin::{ChunkRange, BIN_NONE};
use crate::wire::{
    opt, ChunkAddressing, ContentIntegrity, MerkleHashFunc, MsgTag, WireError, MAX_DATAGRAM,
};

/// Per-channel decode/encode context.
#[derive(Debug, Clone, Copy)]
pub struct DatagramCtx {
    pub addressing: ChunkAddressing,
    pub hash_len: usize,
    pub sig_len: usize,
}

impl Default for DatagramCtx {
    fn default() -> Self {
        Self {
            addressing: ChunkAddressing::ChunkRange32,
            hash_len: MerkleHashFunc::Sha1.hash_len(),
            sig_len: 20,
        }
    }
}

/// A decoded protocol record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Data {
        range: ChunkRange,
        timestamp: u64,
        payload: Bytes,
    },
    Ack {
        range: ChunkRange,
        timestamp: u64,
    },
    /// `None` is the empty HAVE (`BIN_NONE` on a bin-addressed channel).
    Have(Option<ChunkRange>),
    Integrity {
        range: ChunkRange,
        hash: Vec<u8>,
    },
    SignedIntegrity {
        range: ChunkRange,
        timestamp: u64,
        signature: Vec<u8>,
    },
    Request(ChunkRange),
    Cancel(ChunkRange),
    Choke,
    Unchoke,
    PexReq,
    PexResV4(SocketAddrV4),
    PexResV6(SocketAddrV6),
    PexResCert(Bytes),
}

/// Handshake record payload: the sender's channel id plus the option block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub channel: u32,
    pub version: u8,
    pub min_version: u8,
    pub swarm_id: Option<Vec<u8>>,
    pub content_integrity: ContentIntegrity,
    pub merkle_hash_func: MerkleHashFunc,
    pub live_sig_alg: u8,
    pub chunk_addressing: ChunkAddressing,
    pub live_discard_window: Option<u64>,
    pub supported_msgs: Option<Vec<u8>>,
}

impl Handshake {
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            version: crate::wire::PROTOCOL_VERSION,
            min_version: crate::wire::PROTOCOL_VERSION,
            swarm_id: None,
            content_integrity: ContentIntegrity::default(),
            merkle_hash_func: MerkleHashFunc::default(),
            live_sig_alg: 0,
            chunk_addressing: ChunkAddressing::default(),
            live_discard_window: None,
            supported_msgs: None,
        }
    }

    /// The explicit close record: channel zero, no options.
    pub fn close() -> Self {
        Self::new(0)
    }

    pub fn is_close(&self) -> bool {
        self.channel == 0
    }
}

// ── Decode ───────────────────────────────────────────────────────────────────

fn need(buf: &[u8], n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn get_range(buf: &mut &[u8], ctx: &DatagramCtx) -> Result<Option<ChunkRange>, WireError> {
    match ctx.addressing {
        ChunkAddressing::Bin32 => {
            need(buf, 4)?;
            let bin = buf.get_u32();
            if bin == BIN_NONE {
                return Ok(None);
            }
            Ok(ChunkRange::from_bin(bin))
        }
        ChunkAddressing::ChunkRange32 => {
            need(buf, 8)?;
            let start = buf.get_u32();
            let end = buf.get_u32();
            if start > end {
                return Err(WireError::Truncated);
            }
            Ok(Some(ChunkRange::new(start, end)))
        }
    }
}

fn require_range(buf: &mut &[u8], ctx: &DatagramCtx) -> Result<ChunkRange, WireError> {
    get_range(buf, ctx)?.ok_or(WireError::Truncated)
}

/// Decode a full datagram: channel id plus every record until the end.
/// An empty record list is a keepalive.
pub fn decode_datagram(ctx: &DatagramCtx, data: &[u8]) -> Result<(u32, Vec<Message>), WireError> {
    let mut buf = data;
    need(buf, 4)?;
    let channel = buf.get_u32();
    let mut messages = Vec::new();
    while buf.has_remaining() {
        messages.push(decode_message(ctx, &mut buf)?);
    }
    Ok((channel, messages))
}

fn decode_message(ctx: &DatagramCtx, buf: &mut &[u8]) -> Result<Message, WireError> {
    let tag = MsgTag::try_from(buf.get_u8())?;
    Ok(match tag {
        MsgTag::Handshake => Message::Handshake(decode_handshake(ctx, buf)?),
        MsgTag::Data => {
            let range = require_range(buf, ctx)?;
            need(buf, 8)?;
            let timestamp = buf.get_u64();
            let payload = Bytes::copy_from_slice(buf);
            buf.advance(buf.remaining());
            Message::Data {
                range,
                timestamp,
                payload,
            }
        }
        MsgTag::Ack => {
            let range = require_range(buf, ctx)?;
            need(buf, 8)?;
            Message::Ack {
                range,
                timestamp: buf.get_u64(),
            }
        }
        MsgTag::Have => Message::Have(get_range(buf, ctx)?),
        MsgTag::Integrity => {
            let range = require_range(buf, ctx)?;
            need(buf, ctx.hash_len)?;
            let mut hash = vec![0u8; ctx.hash_len];
            buf.copy_to_slice(&mut hash);
            Message::Integrity { range, hash }
        }
        MsgTag::SignedIntegrity => {
            let range = require_range(buf, ctx)?;
            need(buf, 8 + ctx.sig_len)?;
            let timestamp = buf.get_u64();
            let mut signature = vec![0u8; ctx.sig_len];
            buf.copy_to_slice(&mut signature);
            Message::SignedIntegrity {
                range,
                timestamp,
                signature,
            }
        }
        MsgTag::Request => Message::Request(require_range(buf, ctx)?),
        MsgTag::Cancel => Message::Cancel(require_range(buf, ctx)?),
        MsgTag::Choke => Message::Choke,
        MsgTag::Unchoke => Message::Unchoke,
        MsgTag::PexReq => Message::PexReq,
        MsgTag::PexResV4 => {
            need(buf, 6)?;
            let ip = Ipv4Addr::from(buf.get_u32());
            let port = buf.get_u16();
            Message::PexResV4(SocketAddrV4::new(ip, port))
        }
        MsgTag::PexResV6 => {
            need(buf, 18)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Message::PexResV6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
        MsgTag::PexResCert => {
            need(buf, 2)?;
            let len = buf.get_u16() as usize;
            need(buf, len)?;
            let cert = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Message::PexResCert(cert)
        }
    })
}

fn decode_handshake(ctx: &DatagramCtx, buf: &mut &[u8]) -> Result<Handshake, WireError> {
    need(buf, 4)?;
    let mut hs = Handshake::new(buf.get_u32());
    loop {
        need(buf, 1)?;
        let opt_type = buf.get_u8();
        match opt_type {
            opt::END => break,
            opt::VERSION => {
                need(buf, 1)?;
                hs.version = buf.get_u8();
            }
            opt::MIN_VERSION => {
                need(buf, 1)?;
                hs.min_version = buf.get_u8();
            }
            opt::SWARM_ID => {
                need(buf, 2)?;
                let len = buf.get_u16() as usize;
                if len == 0 || len > 1024 {
                    return Err(WireError::SwarmIdLength(len));
                }
                need(buf, len)?;
                let mut id = vec![0u8; len];
                buf.copy_to_slice(&mut id);
                hs.swarm_id = Some(id);
            }
            opt::CONTENT_INTEGRITY => {
                need(buf, 1)?;
                hs.content_integrity = ContentIntegrity::try_from(buf.get_u8())?;
            }
            opt::MERKLE_HASH_FUNC => {
                need(buf, 1)?;
                hs.merkle_hash_func = MerkleHashFunc::try_from(buf.get_u8())?;
            }
            opt::LIVE_SIG_ALG => {
                need(buf, 1)?;
                hs.live_sig_alg = buf.get_u8();
            }
            opt::CHUNK_ADDRESSING => {
                need(buf, 1)?;
                hs.chunk_addressing = ChunkAddressing::try_from(buf.get_u8())?;
            }
            opt::LIVE_DISCARD_WINDOW => {
                let len = ctx.addressing.discard_window_len();
                need(buf, len)?;
                let mut window = 0u64;
                for _ in 0..len {
                    window = (window << 8) | u64::from(buf.get_u8());
                }
                hs.live_discard_window = Some(window);
            }
            opt::SUPPORTED_MSGS => {
                need(buf, 2)?;
                let len = buf.get_u16() as usize;
                need(buf, len)?;
                let mut bitmap = vec![0u8; len];
                buf.copy_to_slice(&mut bitmap);
                hs.supported_msgs = Some(bitmap);
            }
            other => return Err(WireError::UnknownOption(other)),
        }
    }
    Ok(hs)
}

/// The pre-versioned handshake shape some peers still open with: an
/// INTEGRITY record over the all-bin carrying the swarm id, then an
/// option-less HANDSHAKE. Returns (swarm id, remote channel) if the record
/// section matches.
pub fn decode_legacy_handshake(records: &[u8]) -> Option<(Vec<u8>, u32)> {
    let mut buf = records;
    let mut swarm_id = None;
    if buf.remaining() >= 1 && buf[0] == MsgTag::Integrity as u8 {
        buf.advance(1);
        if buf.remaining() < 4 + 20 {
            return None;
        }
        let bin = buf.get_u32();
        if bin != crate::bin::BIN_ALL {
            return None;
        }
        let mut id = vec![0u8; 20];
        buf.copy_to_slice(&mut id);
        swarm_id = Some(id);
    }
    if buf.remaining() < 5 || buf[0] != MsgTag::Handshake as u8 {
        return None;
    }
    buf.advance(1);
    let channel = buf.get_u32();
    Some((swarm_id?, channel))
}

// ── Encode ───────────────────────────────────────────────────────────────────

fn put_range(
    out: &mut BytesMut,
    ctx: &DatagramCtx,
    range: Option<&ChunkRange>,
) -> Result<(), WireError> {
    match ctx.addressing {
        ChunkAddressing::Bin32 => {
            let bin = match range {
                None => BIN_NONE,
                // The caller splits unaligned runs into bins before encoding.
                Some(r) => r.to_bin().ok_or(WireError::Truncated)?,
            };
            out.put_u32(bin);
        }
        ChunkAddressing::ChunkRange32 => {
            let r = range.ok_or(WireError::Truncated)?;
            out.put_u32(r.start);
            out.put_u32(r.end);
        }
    }
    Ok(())
}

/// Encode a datagram. An empty message slice yields a keepalive (channel id
/// only).
pub fn encode_datagram(
    ctx: &DatagramCtx,
    channel: u32,
    messages: &[Message],
) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(MAX_DATAGRAM);
    out.put_u32(channel);
    for msg in messages {
        encode_message(ctx, &mut out, msg)?;
    }
    if out.len() > MAX_DATAGRAM {
        return Err(WireError::Oversize);
    }
    Ok(out.freeze())
}

fn encode_message(ctx: &DatagramCtx, out: &mut BytesMut, msg: &Message) -> Result<(), WireError> {
    match msg {
        Message::Handshake(hs) => {
            out.put_u8(MsgTag::Handshake as u8);
            out.put_u32(hs.channel);
            if hs.is_close() {
                out.put_u8(opt::END);
                return Ok(());
            }
            out.put_u8(opt::VERSION);
            out.put_u8(hs.version);
            out.put_u8(opt::MIN_VERSION);
            out.put_u8(hs.min_version);
            if let Some(id) = &hs.swarm_id {
                out.put_u8(opt::SWARM_ID);
                out.put_u16(id.len() as u16);
                out.put_slice(id);
            }
            out.put_u8(opt::CONTENT_INTEGRITY);
            out.put_u8(hs.content_integrity as u8);
            out.put_u8(opt::MERKLE_HASH_FUNC);
            out.put_u8(hs.merkle_hash_func as u8);
            out.put_u8(opt::LIVE_SIG_ALG);
            out.put_u8(hs.live_sig_alg);
            out.put_u8(opt::CHUNK_ADDRESSING);
            out.put_u8(hs.chunk_addressing as u8);
            if let Some(window) = hs.live_discard_window {
                out.put_u8(opt::LIVE_DISCARD_WINDOW);
                match ctx.addressing.discard_window_len() {
                    8 => out.put_u64(window),
                    _ => out.put_u32(window as u32),
                }
            }
            if let Some(bitmap) = &hs.supported_msgs {
                out.put_u8(opt::SUPPORTED_MSGS);
                out.put_u16(bitmap.len() as u16);
                out.put_slice(bitmap);
            }
            out.put_u8(opt::END);
        }
        Message::Data {
            range,
            timestamp,
            payload,
        } => {
            out.put_u8(MsgTag::Data as u8);
            put_range(out, ctx, Some(range))?;
            out.put_u64(*timestamp);
            out.put_slice(payload);
        }
        Message::Ack { range, timestamp } => {
            out.put_u8(MsgTag::Ack as u8);
            put_range(out, ctx, Some(range))?;
            out.put_u64(*timestamp);
        }
        Message::Have(range) => {
            out.put_u8(MsgTag::Have as u8);
            put_range(out, ctx, range.as_ref())?;
        }
        Message::Integrity { range, hash } => {
            out.put_u8(MsgTag::Integrity as u8);
            put_range(out, ctx, Some(range))?;
            out.put_slice(hash);
        }
        Message::SignedIntegrity {
            range,
            timestamp,
            signature,
        } => {
            out.put_u8(MsgTag::SignedIntegrity as u8);
            put_range(out, ctx, Some(range))?;
            out.put_u64(*timestamp);
            out.put_slice(signature);
        }
        Message::Request(range) => {
            out.put_u8(MsgTag::Request as u8);
            put_range(out, ctx, Some(range))?;
        }
        Message::Cancel(range) => {
            out.put_u8(MsgTag::Cancel as u8);
            put_range(out, ctx, Some(range))?;
        }
        Message::Choke => out.put_u8(MsgTag::Choke as u8),
        Message::Unchoke => out.put_u8(MsgTag::Unchoke as u8),
        Message::PexReq => out.put_u8(MsgTag::PexReq as u8),
        Message::PexResV4(addr) => {
            out.put_u8(MsgTag::PexResV4 as u8);
            out.put_u32((*addr.ip()).into());
            out.put_u16(addr.port());
        }
        Message::PexResV6(addr) => {
            out.put_u8(MsgTag::PexResV6 as u8);
            out.put_slice(&addr.ip().octets());
            out.put_u16(addr.port());
        }
        Message::PexResCert(cert) => {
            out.put_u8(MsgTag::PexResCert as u8);
            out.put_u16(cert.len() as u16);
            out.put_slice(cert);
        }
    }
    Ok(())
}
