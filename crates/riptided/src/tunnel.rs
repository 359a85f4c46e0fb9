//! Datagram tunneling between control clients and the swarm UDP socket.
//!
//! `TUNNELSEND <ip:port>/<chanhex> <size>` wraps the following raw bytes in
//! a datagram whose channel id is `chanhex`. Inbound datagrams on channel
//! 0xffffffff are addressed to the control client and surface as
//! `TUNNELRECV` lines.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

/// Wrap a tunnel payload into a raw datagram.
pub fn encode(channel: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_u32(channel);
    out.put_slice(payload);
    out.freeze()
}

/// Parse the `<ip:port>/<chanhex>` target of a TUNNELSEND command.
pub fn parse_target(target: &str) -> Option<(SocketAddr, u32)> {
    let (addr, chan) = target.rsplit_once('/')?;
    let addr: SocketAddr = addr.parse().ok()?;
    if chan.len() != 8 {
        return None;
    }
    let channel = u32::from_str_radix(chan, 16).ok()?;
    Some((addr, channel))
}
