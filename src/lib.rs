//! `swarmkeep` implements the core of a BitTorrent swarm manager: a bounded
//! connection pool with backpressure, per-peer handshake/backoff state
//! machines, and a shared TCP listener that demultiplexes incoming
//! handshakes to the correct swarm by info hash.
//!
//! The actual BitTorrent wire protocol codec (framing, piece
//! request/response, choke/interest, extensions), alternative transports
//! (WebRTC, HTTP seeding), torrent metadata parsing, piece storage, and
//! tracker discovery are all external collaborators. This crate treats a
//! peer connection as an opaque duplex transport plus a [`wire::Wire`] that
//! emits a handful of protocol-level events; see that module for the
//! contract such a consumer must satisfy.

pub mod addr;
pub mod conf;
pub mod error;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod speedometer;
pub mod swarm;
pub mod transport;
pub mod wire;

use std::fmt;

/// 20-byte SHA-1 info hash identifying a torrent; also the routing key a
/// [`pool::Pool`] uses to demultiplex incoming handshakes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Builds an info hash from its 20 raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parses a 40-character lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut buf = [0u8; 20];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }

    /// Returns the lowercase hex form used as a map key by [`pool::Pool`].
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 20-byte peer id chosen by the local client (BEP 20).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut buf = [0u8; 20];
        hex::decode_to_slice(s, &mut buf)?;
        Ok(Self(buf))
    }

    /// Builds a peer id from a UTF-8 string, padding with zero bytes or
    /// truncating so the result is always exactly 20 bytes.
    pub fn from_utf8_lossy(s: &str) -> Self {
        let mut buf = [0u8; 20];
        let bytes = s.as_bytes();
        let n = bytes.len().min(20);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The key under which a swarm stores a peer in `_peers`/`_queue`. Handlers
/// refer to a peer by this key rather than by a strong reference, so that
/// destruction can unlink a peer in O(1) without dangling callback captures.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// A TCP peer, keyed by its textual `host:port` address.
    Addr(String),
    /// A non-TCP peer (e.g. WebRTC), keyed by an opaque connection id.
    Opaque(String),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Addr(s) => write!(f, "{}", s),
            PeerKey::Opaque(s) => write!(f, "webrtc:{}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_hex_roundtrip() {
        let bytes = [0x11u8; 20];
        let hash = InfoHash::new(bytes);
        assert_eq!(hash.to_hex(), "1111111111111111111111111111111111111111");
        assert_eq!(InfoHash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn peer_id_from_utf8_lossy_pads_and_truncates() {
        let short = PeerId::from_utf8_lossy("abc");
        assert_eq!(&short.0[..3], b"abc");
        assert_eq!(&short.0[3..], &[0u8; 17][..]);

        let long = PeerId::from_utf8_lossy("012345678901234567890123");
        assert_eq!(long.0.len(), 20);
        assert_eq!(&long.0, b"01234567890123456789");
    }

    #[test]
    fn peer_key_display() {
        assert_eq!(
            PeerKey::Addr("127.0.0.1:6881".to_string()).to_string(),
            "127.0.0.1:6881"
        );
        assert_eq!(
            PeerKey::Opaque("abc123".to_string()).to_string(),
            "webrtc:abc123"
        );
    }
}
