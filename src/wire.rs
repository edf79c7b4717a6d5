//! The wire adapter contract.
//!
//! The core depends on a duplex byte-stream peer-protocol codec satisfying
//! this contract; it never implements the BitTorrent wire protocol itself
//! (framing, handshake message layout, piece request/response,
//! choke/interest, extensions are all out of scope here). A real
//! implementation sits on top of a [`crate::transport::Transport`] and is
//! constructed through a [`WireFactory`] supplied by whoever embeds this
//! crate.

use crate::transport::Transport;
use crate::{InfoHash, PeerId};
use tokio::sync::mpsc;

/// Extension flags exchanged in the handshake's reserved bytes (BEP 10 and
/// friends). The core treats this as opaque payload; it neither inspects
/// nor negotiates individual extension bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeOpts {
    pub extensions: [u8; 8],
}

/// Events a [`Wire`] emits, as listed in spec §4.4. `Download`/`Upload`
/// carry the number of bytes transferred since the event was last fired,
/// not a cumulative total.
#[derive(Debug)]
pub enum WireEvent {
    /// Fired once upon receipt of the remote peer's handshake.
    Handshake {
        info_hash: InfoHash,
        peer_id: PeerId,
        extensions: [u8; 8],
    },
    Download(u64),
    Upload(u64),
    /// The remote end closed its write half cleanly.
    End,
    /// An unrecoverable protocol or I/O error occurred.
    Error(String),
    /// The wire was closed (our side or the remote's).
    Close,
    /// Our write half finished flushing after a shutdown.
    Finish,
}

/// A handle to a single wire (framed peer-protocol stream layered atop a
/// transport). Methods are synchronous commands; the wire reports back
/// asynchronously via the [`WireEventStream`] returned alongside it from
/// [`WireFactory::attach`].
pub trait Wire: Send {
    /// Sends our handshake. The swarm calls this at most once per wire.
    fn handshake(&mut self, info_hash: InfoHash, peer_id: PeerId, opts: HandshakeOpts);

    /// Forces termination. Must eventually cause a [`WireEvent::Close`] to
    /// be emitted on the wire's event stream. Idempotent.
    fn destroy(&mut self);
}

/// The receiving half of a wire's event stream.
pub type WireEventStream = mpsc::UnboundedReceiver<WireEvent>;

/// Constructs [`Wire`]s attached to a given transport. One factory is
/// shared by every peer in a swarm (and, for incoming connections, by every
/// swarm registered on a [`crate::pool::Pool`]'s port).
pub trait WireFactory: Send + Sync {
    /// Attaches a wire to `transport`, returning a command handle and the
    /// stream of events the wire will emit.
    fn attach(&self, transport: Box<dyn Transport>) -> (Box<dyn Wire>, WireEventStream);
}

/// Test-only in-memory [`Wire`]/[`WireFactory`] implementation that lets a
/// test script drive handshake and byte-counter events explicitly, without
/// a real peer-protocol codec (which is out of scope for this crate).
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared state between a [`MockWire`] handle and the test driving it.
    struct Shared {
        destroyed: bool,
        handshake_sent: Option<(InfoHash, PeerId, HandshakeOpts)>,
        events_tx: mpsc::UnboundedSender<WireEvent>,
    }

    /// A handle the swarm/peer code holds; forwards `handshake`/`destroy`
    /// calls to the shared state and, for `destroy`, emits `Close`.
    pub struct MockWire {
        shared: Arc<Mutex<Shared>>,
    }

    impl Wire for MockWire {
        fn handshake(&mut self, info_hash: InfoHash, peer_id: PeerId, opts: HandshakeOpts) {
            let mut shared = self.shared.lock().unwrap();
            shared.handshake_sent = Some((info_hash, peer_id, opts));
        }

        fn destroy(&mut self) {
            let mut shared = self.shared.lock().unwrap();
            if shared.destroyed {
                return;
            }
            shared.destroyed = true;
            let _ = shared.events_tx.send(WireEvent::Close);
        }
    }

    /// A handle the *test* holds, to push events as if they arrived from
    /// the remote peer.
    #[derive(Clone)]
    pub struct MockWireController {
        shared: Arc<Mutex<Shared>>,
    }

    impl MockWireController {
        pub fn emit(&self, event: WireEvent) {
            let shared = self.shared.lock().unwrap();
            let _ = shared.events_tx.send(event);
        }

        pub fn remote_handshake(&self, info_hash: InfoHash, peer_id: PeerId) {
            self.emit(WireEvent::Handshake {
                info_hash,
                peer_id,
                extensions: [0; 8],
            });
        }

        pub fn handshake_sent(&self) -> Option<(InfoHash, PeerId, HandshakeOpts)> {
            self.shared.lock().unwrap().handshake_sent
        }

        pub fn is_destroyed(&self) -> bool {
            self.shared.lock().unwrap().destroyed
        }
    }

    /// A factory that, on `attach`, produces a fresh [`MockWire`] and
    /// stashes its [`MockWireController`] so the test can retrieve it.
    #[derive(Clone, Default)]
    pub struct MockWireFactory {
        controllers: Arc<Mutex<Vec<MockWireController>>>,
    }

    impl MockWireFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns controllers for every wire attached so far, oldest first.
        pub fn controllers(&self) -> Vec<MockWireController> {
            self.controllers.lock().unwrap().clone()
        }

        /// Waits for and returns the `n`th controller (0-based), polling
        /// briefly since attachment may race the caller.
        pub async fn nth(&self, n: usize) -> MockWireController {
            loop {
                if let Some(c) = self.controllers().get(n).cloned() {
                    return c;
                }
                tokio::time::delay_for(std::time::Duration::from_millis(5)).await;
            }
        }
    }

    impl WireFactory for MockWireFactory {
        fn attach(&self, mut transport: Box<dyn Transport>) -> (Box<dyn Wire>, WireEventStream) {
            // the mock never drives the transport's bytes; it still takes
            // ownership so the transport is dropped (and destroyed) with
            // the wire, matching a real codec's ownership of the socket.
            transport.destroy();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let shared = Arc::new(Mutex::new(Shared {
                destroyed: false,
                handshake_sent: None,
                events_tx,
            }));
            self.controllers.lock().unwrap().push(MockWireController {
                shared: shared.clone(),
            });
            (Box::new(MockWire { shared }), events_rx)
        }
    }
}
