//! One [`Pool`] per listening TCP port: owns the listening socket and
//! demultiplexes incoming connections to the correct [`crate::swarm::Swarm`]
//! by the info hash carried in the remote's handshake.
//!
//! Like a [`crate::swarm::Swarm`], a `Pool` is an actor: a single task owns
//! the listener and the `swarms`/`conns` tables, reached only through
//! [`PoolHandle`]'s command channel, so incoming accepts and
//! `addSwarm`/`removeSwarm` are always serialized against each other.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{select, FutureExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::conf::PoolConf;
use crate::error::Error;
use crate::swarm;
use crate::transport::{Transport, TcpTransport};
use crate::wire::{WireEvent, WireEventStream, WireFactory};
use crate::{InfoHash, PeerId, PeerKey};

/// A cheaply-cloneable handle to a running [`Pool`] actor.
#[derive(Clone)]
pub struct PoolHandle {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Registers `info_hash` with this pool so that incoming handshakes
    /// claiming it are routed to `swarm_tx`. Fails with
    /// [`Error::DuplicateInfoHash`] if another swarm on this port already
    /// claims the same info hash, or [`Error::Closed`] if the pool's actor
    /// has already shut down.
    pub(crate) async fn add_swarm(
        &self,
        info_hash: InfoHash,
        swarm_tx: mpsc::UnboundedSender<swarm::Command>,
    ) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::AddSwarm {
                info_hash,
                swarm_tx,
                reply: reply_tx,
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Deregisters `info_hash`. Returns whether this was the pool's last
    /// swarm (in which case its listener has already been closed by the
    /// time this returns).
    pub(crate) async fn remove_swarm(&self, info_hash: InfoHash) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(PoolCommand::RemoveSwarm {
                info_hash,
                reply: reply_tx,
            })
            .is_err()
        {
            // actor already gone; it can only have gone away by emptying
            // out, so report "yes, this was the last one".
            return true;
        }
        reply_rx.await.unwrap_or(true)
    }
}

enum PoolCommand {
    AddSwarm {
        info_hash: InfoHash,
        swarm_tx: mpsc::UnboundedSender<swarm::Command>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RemoveSwarm {
        info_hash: InfoHash,
        reply: oneshot::Sender<bool>,
    },
    ConnDone {
        id: u64,
        result: ConnResult,
    },
}

/// The outcome of demultiplexing one incoming, pre-handshake connection.
enum ConnResult {
    Matched {
        info_hash: InfoHash,
        key: PeerKey,
        wire: Box<dyn crate::wire::Wire>,
        events: WireEventStream,
        peer_id: PeerId,
        extensions: [u8; 8],
    },
    Failed,
}

/// Spawns a pool actor already listening on `listener` and returns a handle
/// to it.
pub(crate) fn spawn(
    port: u16,
    listener: TcpListener,
    conf: PoolConf,
    wire_factory: Arc<dyn WireFactory>,
) -> PoolHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = PoolActor {
        port,
        conf,
        wire_factory,
        listener,
        swarms: HashMap::new(),
        conns: HashMap::new(),
        next_conn_id: 0,
        self_tx: cmd_tx.clone(),
    };
    tokio::spawn(actor.run(cmd_rx));
    PoolHandle { cmd_tx }
}

struct PoolActor {
    port: u16,
    conf: PoolConf,
    wire_factory: Arc<dyn WireFactory>,
    listener: TcpListener,
    /// Info hash -> the owning swarm's command sender. Unique per port,
    /// per spec's "a given info-hash appears in at most one Pool" and
    /// "duplicate registration fails loudly" invariants.
    swarms: HashMap<InfoHash, mpsc::UnboundedSender<swarm::Command>>,
    /// Incoming connections not yet claimed by a swarm, so they can be
    /// force-closed if the pool shuts down mid-handshake.
    conns: HashMap<u64, oneshot::Sender<()>>,
    next_conn_id: u64,
    self_tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolActor {
    async fn run(mut self, cmd_rx: mpsc::UnboundedReceiver<PoolCommand>) {
        log::info!("pool listening on port {}", self.port);
        let mut cmd_rx = cmd_rx.fuse();
        loop {
            let mut incoming = self.listener.incoming();
            select! {
                accepted = incoming.next().fuse() => match accepted {
                    Some(Ok(stream)) => self.on_accept(stream),
                    Some(Err(e)) => log::warn!("pool on port {}: accept error: {}", self.port, e),
                    None => {
                        log::info!("pool on port {}: listener closed", self.port);
                        break;
                    }
                },
                cmd = cmd_rx.next() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        log::info!("pool on port {} shut down", self.port);
    }

    fn on_accept(&mut self, stream: TcpStream) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("pool on port {}: accepted socket with no peer addr: {}", self.port, e);
                return;
            }
        };
        let key = PeerKey::Addr(addr.to_string());
        log::debug!("pool on port {}: accepted connection from {}", self.port, key);

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.conns.insert(id, cancel_tx);

        let transport: Box<dyn Transport> = Box::new(TcpTransport::new(stream, addr));
        tokio::spawn(demux_incoming(
            id,
            key,
            transport,
            self.wire_factory.clone(),
            self.conf.handshake_timeout_in,
            cancel_rx,
            self.self_tx.clone(),
        ));
    }

    /// Returns `true` if the pool should shut down.
    fn handle_command(&mut self, cmd: PoolCommand) -> bool {
        match cmd {
            PoolCommand::AddSwarm {
                info_hash,
                swarm_tx,
                reply,
            } => {
                if self.swarms.contains_key(&info_hash) {
                    log::info!(
                        "pool on port {}: duplicate registration for info hash {}",
                        self.port,
                        info_hash
                    );
                    let _ = reply.send(Err(Error::DuplicateInfoHash));
                } else {
                    self.swarms.insert(info_hash, swarm_tx);
                    let _ = reply.send(Ok(()));
                }
                false
            }
            PoolCommand::RemoveSwarm { info_hash, reply } => {
                self.swarms.remove(&info_hash);
                let was_last = self.swarms.is_empty();
                if was_last {
                    log::info!("pool on port {}: last swarm removed, shutting down", self.port);
                    for (_, cancel_tx) in self.conns.drain() {
                        let _ = cancel_tx.send(());
                    }
                }
                let _ = reply.send(was_last);
                was_last
            }
            PoolCommand::ConnDone { id, result } => {
                self.conns.remove(&id);
                match result {
                    ConnResult::Matched {
                        info_hash,
                        key,
                        wire,
                        events,
                        peer_id,
                        extensions,
                    } => match self.swarms.get(&info_hash) {
                        Some(swarm_tx) => {
                            let msg = swarm::Command::Incoming {
                                key,
                                wire,
                                events,
                                remote_peer_id: peer_id,
                                extensions,
                            };
                            if let Err(mpsc::error::SendError(swarm::Command::Incoming {
                                mut wire,
                                ..
                            })) = swarm_tx.send(msg)
                            {
                                log::debug!("swarm for info hash {} gone, dropping peer", info_hash);
                                wire.destroy();
                            }
                        }
                        None => {
                            log::info!(
                                "pool on port {}: peer {} handshook unknown info hash {}",
                                self.port,
                                key,
                                info_hash
                            );
                        }
                    },
                    ConnResult::Failed => {}
                }
                false
            }
        }
    }
}

/// Waits (bounded by `timeout`) for the remote's handshake on a freshly
/// attached wire and reports the outcome back to the pool actor. The pool
/// never sends its own handshake: that's the claiming swarm's job, once it
/// adopts the peer (spec §4.1 `_onincoming`).
async fn demux_incoming(
    id: u64,
    key: PeerKey,
    transport: Box<dyn Transport>,
    wire_factory: Arc<dyn WireFactory>,
    timeout: Duration,
    cancel: oneshot::Receiver<()>,
    self_tx: mpsc::UnboundedSender<PoolCommand>,
) {
    let (mut wire, events) = wire_factory.attach(transport);
    let mut events = events.fuse();
    let mut cancel = cancel.fuse();
    let mut deadline = tokio::time::delay_for(timeout).fuse();

    let result = select! {
        event = events.next() => match event {
            Some(WireEvent::Handshake { info_hash, peer_id, extensions }) => {
                ConnResult::Matched {
                    info_hash,
                    key: key.clone(),
                    wire,
                    events: events.into_inner(),
                    peer_id,
                    extensions,
                }
            }
            _ => {
                log::debug!("peer {} wire ended before handshake", key);
                wire.destroy();
                ConnResult::Failed
            }
        },
        _ = cancel => {
            log::debug!("peer {} cancelled (pool shutting down)", key);
            wire.destroy();
            ConnResult::Failed
        },
        _ = deadline => {
            log::info!("peer {} handshake timed out (inbound)", key);
            wire.destroy();
            ConnResult::Failed
        },
    };

    let _ = self_tx.send(PoolCommand::ConnDone { id, result });
}

/// Binds `port`, retrying up to `conf.bind_retries` times with
/// `conf.bind_retry_delay` between attempts on `EADDRINUSE`.
pub(crate) async fn bind_with_retry(port: u16, conf: &PoolConf) -> Result<TcpListener, Error> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < conf.bind_retries => {
                attempt += 1;
                log::warn!(
                    "port {} in use, retrying ({}/{})",
                    port,
                    attempt,
                    conf.bind_retries
                );
                tokio::time::delay_for(conf.bind_retry_delay).await;
            }
            Err(e) => return Err(Error::Bind(e)),
        }
    }
}

/// Scans forward from `base` over the ephemeral port range (wrapping once)
/// for a port that binds successfully, without retrying any single port.
pub(crate) async fn bind_ephemeral(base: u16) -> Result<(TcpListener, u16), Error> {
    use crate::conf::{EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};

    let span = (EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) as u32 + 1;
    let start_offset = (base.saturating_sub(EPHEMERAL_PORT_MIN)) as u32;
    for step in 0..span {
        let offset = (start_offset + step) % span;
        let port = EPHEMERAL_PORT_MIN + offset as u16;
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(Error::Bind(e)),
        }
    }
    Err(Error::NoFreeEphemeralPort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::mock::MockWireFactory;

    #[tokio::test]
    async fn duplicate_info_hash_on_same_port_is_rejected() {
        let conf = PoolConf::default();
        let wire_factory: Arc<dyn WireFactory> = Arc::new(MockWireFactory::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = spawn(port, listener, conf, wire_factory);

        let info_hash = InfoHash::new([3u8; 20]);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        handle.add_swarm(info_hash, tx1).await.unwrap();
        let err = handle.add_swarm(info_hash, tx2).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateInfoHash));
    }

    #[tokio::test]
    async fn removing_the_last_swarm_frees_the_port() {
        let conf = PoolConf::default();
        let wire_factory: Arc<dyn WireFactory> = Arc::new(MockWireFactory::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = spawn(port, listener, conf, wire_factory);

        let info_hash = InfoHash::new([4u8; 20]);
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.add_swarm(info_hash, tx).await.unwrap();

        let was_last = handle.remove_swarm(info_hash).await;
        assert!(was_last);

        // the port should be free again now that the pool's listener is gone.
        let relisten = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(relisten.is_ok());
    }

    #[tokio::test]
    async fn second_swarm_on_same_port_is_accepted() {
        let conf = PoolConf::default();
        let wire_factory: Arc<dyn WireFactory> = Arc::new(MockWireFactory::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = spawn(port, listener, conf, wire_factory);

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        handle.add_swarm(InfoHash::new([5u8; 20]), tx_a).await.unwrap();
        handle.add_swarm(InfoHash::new([6u8; 20]), tx_b).await.unwrap();

        // neither removal is the last, so the port stays claimed.
        assert!(!handle.remove_swarm(InfoHash::new([5u8; 20])).await);
        assert!(handle.remove_swarm(InfoHash::new([6u8; 20])).await);
    }
}
