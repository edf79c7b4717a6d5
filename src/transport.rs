//! The duplex transport contract consumed by a [`crate::wire::Wire`].
//!
//! TCP, WebRTC, and HTTP-seed peers all satisfy the same
//! dial/pipe/destroy/close-or-error-or-end contract; this module defines
//! the capability trait and the one concrete implementation in scope for
//! this crate, TCP. WebRTC and HTTP-seed transports are pluggable peer
//! transports outside this crate's scope (see spec §1); a consumer wanting
//! them implements this same trait.

use std::net::SocketAddr;

use tokio::net::TcpStream;

/// An established duplex byte-stream connection to a peer.
///
/// The inbound/outbound distinction is captured by how the owning
/// [`crate::peer`] task was constructed, not by this trait: by the time a
/// `Transport` exists, dialing (if any) has already completed.
pub trait Transport: Send {
    /// Forces the connection closed. Idempotent at the transport level;
    /// repeated calls are harmless no-ops after the first.
    fn destroy(&mut self);
}

/// A plain TCP transport, wrapping a connected [`TcpStream`].
pub struct TcpTransport {
    pub stream: TcpStream,
    pub addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }
}

impl Transport for TcpTransport {
    fn destroy(&mut self) {
        // best-effort; a peer that has already half-closed or reset the
        // connection makes this a harmless error we only log.
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            log::debug!("error shutting down TCP transport to {}: {}", self.addr, e);
        }
    }
}

/// Dials a TCP peer at `host:port`, resolving `host` the way
/// [`tokio::net::ToSocketAddrs`] does (DNS lookup for hostnames, parsed
/// directly for IP literals).
pub async fn dial(host: &str, port: u16) -> std::io::Result<TcpTransport> {
    let stream = TcpStream::connect((host, port)).await?;
    let addr = stream.peer_addr()?;
    Ok(TcpTransport::new(stream, addr))
}
