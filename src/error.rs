//! Error types for the swarm manager core.
//!
//! Following the rest of the dependency stack, these are hand-rolled enums
//! with manual `Display`/`std::error::Error` impls rather than a
//! derive-macro error crate.

use std::fmt;
use std::io;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a [`crate::swarm::Swarm`] or [`crate::pool::Pool`] can surface.
#[derive(Debug)]
pub enum Error {
    /// A TCP listener bind failed, including after exhausting
    /// [`crate::conf::PoolConf::bind_retries`] retries on `EADDRINUSE`.
    Bind(io::Error),
    /// No free port could be found while scanning the ephemeral range.
    NoFreeEphemeralPort,
    /// A second swarm tried to register the same info hash on a port that
    /// already has a swarm with that info hash.
    DuplicateInfoHash,
    /// The remote peer's handshake carried an info hash that didn't match
    /// ours.
    InfoHashMismatch,
    /// The handshake deadline elapsed before the peer completed it.
    HandshakeTimeout,
    /// The outbound TCP connect failed.
    Connect(io::Error),
    /// The swarm or pool actor's command channel is gone (the actor task
    /// has already shut down).
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bind(e) => write!(f, "failed to bind listener: {}", e),
            Error::NoFreeEphemeralPort => {
                write!(f, "no free port found in the ephemeral range")
            }
            Error::DuplicateInfoHash => {
                write!(f, "a swarm with this info hash is already registered on this port")
            }
            Error::InfoHashMismatch => {
                write!(f, "peer handshake info hash does not match this swarm's")
            }
            Error::HandshakeTimeout => write!(f, "handshake deadline elapsed"),
            Error::Connect(e) => write!(f, "failed to connect to peer: {}", e),
            Error::Closed => write!(f, "actor's command channel is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(e) | Error::Connect(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Connect(e)
    }
}

/// An address that failed [`crate::addr`] validation. Never propagated to a
/// caller of `Swarm::add` (invalid addresses are silently dropped per spec),
/// but logged so the failure is diagnosable.
#[derive(Debug, PartialEq, Eq)]
pub enum AddrError {
    /// No `:` separator (or an empty host) was found.
    Malformed,
    /// The port half did not parse as `0 < port < 65535`.
    InvalidPort,
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::Malformed => write!(f, "address is not in host:port form"),
            AddrError::InvalidPort => write!(f, "port must satisfy 0 < port < 65535"),
        }
    }
}

impl std::error::Error for AddrError {}
