//! riptide-core — protocol types for the riptide swarm transfer engine.
//!
//! Everything a peer needs to speak the wire protocol and verify content:
//! the datagram codec, chunk addressing, the compact HAVE set, and the
//! peak-anchored Merkle tree. No I/O happens in this crate.

pub mod bin;
pub mod binmap;
pub mod codec;
pub mod config;
pub mod merkle;
pub mod wire;

/// A swarm id: the Merkle root hash of the content (20 bytes for SHA-1).
pub type SwarmId = merkle::Hash;

/// Render a swarm id as lowercase hex, the form used on control lines.
pub fn swarm_id_hex(id: &SwarmId) -> String {
    hex::encode(id)
}

/// Parse a 40-hex-digit swarm id.
pub fn parse_swarm_id(s: &str) -> Option<SwarmId> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// The all-zero swarm id used on ERROR control lines when no swarm applies.
pub const SWARM_ID_ZERO: SwarmId = [0u8; merkle::HASH_SIZE];
