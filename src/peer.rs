//! Per-peer state.
//!
//! A [`Peer`] is never a single long-lived mutable struct shared between the
//! swarm and callbacks (the design note in spec §9 calls this out
//! explicitly as something to avoid): instead, every peer's socket, wire,
//! and handshake-deadline timer live inside a small dedicated task spawned
//! by the owning [`crate::swarm::Swarm`], and the swarm's `_peers` table
//! holds only a [`PeerKey`]-addressed [`PeerSlot`] of bookkeeping plus a
//! command sender to that task. Destroying a peer is then just: send
//! [`PeerCommand::Destroy`] (or let the task end on its own) and drop the
//! table entry — nothing can dangle because nothing outside the task itself
//! ever holds the wire or the transport.

use std::sync::Arc;
use std::time::Duration;

use futures::{select, FutureExt, StreamExt};
use tokio::sync::mpsc;

use crate::addr::Addr;
use crate::swarm::Command;
use crate::transport::{self, Transport};
use crate::wire::{HandshakeOpts, Wire, WireEvent, WireEventStream, WireFactory};
use crate::{InfoHash, PeerId, PeerKey};

/// Commands a peer's task accepts from its owning swarm.
pub enum PeerCommand {
    /// Tear the peer down: destroy its wire/transport and stop the task.
    /// Idempotent; a peer task that has already finished simply drops this.
    Destroy,
}

/// Events a peer's task reports back to the swarm, tagged with the peer's
/// key so the swarm can look the peer up in its table without the task
/// holding a reference back into swarm state.
pub enum PeerEventKind {
    /// The outbound TCP connect failed.
    ConnectFailed,
    /// The handshake deadline elapsed before completion.
    HandshakeTimedOut,
    /// The remote handshake's info hash didn't match ours; the connection
    /// has already been destroyed by the task.
    InfoHashMismatch,
    /// The handshake completed and matched; the peer is now active.
    Active { peer_id: PeerId, extensions: [u8; 8] },
    Download(u64),
    Upload(u64),
    /// The wire ended, closed, errored, or finished, whether before or
    /// after becoming active. The task has destroyed the wire and is about
    /// to end.
    Terminated,
}

/// Bookkeeping the swarm keeps per peer in its `_peers` table. This is the
/// "arena" representation of a [`Peer`](self) described above: just the
/// state needed to route commands and track retry/queue membership, never
/// the transport or wire themselves.
pub struct PeerSlot {
    pub key: PeerKey,
    /// The dial target for an outbound (TCP) peer; `None` for a peer
    /// adopted from an incoming connection, which is never redialed.
    pub addr: Option<Addr>,
    /// Command channel to the peer's task. `None` once the task has ended
    /// and the slot is only waiting to be requeued or dropped.
    pub cmd_tx: Option<mpsc::UnboundedSender<PeerCommand>>,
    /// Number of reconnect attempts made so far; reset to 0 on a
    /// successful handshake.
    pub retries: usize,
    /// Whether this peer currently holds a wire in `Swarm::wires`.
    pub is_active: bool,
    /// Whether this peer is currently sitting in the outbound dial queue
    /// rather than connecting/connected.
    pub is_queued: bool,
}

impl PeerSlot {
    pub fn new(key: PeerKey) -> Self {
        Self {
            key,
            addr: None,
            cmd_tx: None,
            retries: 0,
            is_active: false,
            is_queued: true,
        }
    }

    /// Signals the peer's task to tear itself down. Idempotent: a second
    /// call after the task has already ended (channel closed) is a no-op.
    pub fn destroy(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(PeerCommand::Destroy);
        }
    }
}

/// Spawns the task for an outbound peer: dials `addr`, sends our handshake,
/// and waits (bounded by `handshake_timeout`) for the remote's.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_outbound(
    key: PeerKey,
    addr: Addr,
    info_hash: InfoHash,
    peer_id: PeerId,
    handshake_opts: HandshakeOpts,
    handshake_timeout: Duration,
    wire_factory: Arc<dyn WireFactory>,
    swarm_tx: mpsc::UnboundedSender<Command>,
) -> mpsc::UnboundedSender<PeerCommand> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_outbound(
        key,
        addr,
        info_hash,
        peer_id,
        handshake_opts,
        handshake_timeout,
        wire_factory,
        swarm_tx,
        cmd_rx,
    ));
    cmd_tx
}

#[allow(clippy::too_many_arguments)]
async fn run_outbound(
    key: PeerKey,
    addr: Addr,
    info_hash: InfoHash,
    peer_id: PeerId,
    handshake_opts: HandshakeOpts,
    handshake_timeout: Duration,
    wire_factory: Arc<dyn WireFactory>,
    swarm_tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    log::info!("dialing peer {}", key);

    // a Destroy racing the dial (e.g. an immediate `swarm.remove`) should
    // cancel it rather than connect a peer nobody wants anymore.
    let dial = transport::dial(&addr.host, addr.port).fuse();
    futures::pin_mut!(dial);
    let transport = select! {
        result = dial => result,
        _ = cmd_rx.next() => {
            log::debug!("peer {} destroyed while dialing", key);
            return;
        }
    };
    let transport = match transport {
        Ok(t) => t,
        Err(e) => {
            log::info!("connect to peer {} failed: {}", key, e);
            report(&swarm_tx, key, PeerEventKind::ConnectFailed);
            return;
        }
    };
    log::info!("connected to peer {}", key);

    let (mut wire, events) = wire_factory.attach(Box::new(transport));
    wire.handshake(info_hash, peer_id, handshake_opts);

    await_handshake_then_run(
        key,
        wire,
        events,
        handshake_timeout,
        info_hash,
        swarm_tx,
        cmd_rx,
    )
    .await;
}

/// Waits (bounded by `timeout`) for the remote's handshake, verifies its
/// info hash, and on success falls through into the shared active-peer
/// relay loop. Used by the outbound path; inbound peers skip straight to
/// the relay loop because the pool has already seen their handshake.
async fn await_handshake_then_run(
    key: PeerKey,
    mut wire: Box<dyn Wire>,
    mut events: WireEventStream,
    timeout: Duration,
    info_hash: InfoHash,
    swarm_tx: mpsc::UnboundedSender<Command>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let deadline = tokio::time::timeout(timeout, events.recv()).fuse();
    futures::pin_mut!(deadline);
    let next = select! {
        next = deadline => next,
        cmd = cmd_rx.next() => {
            match cmd {
                Some(PeerCommand::Destroy) | None => {
                    log::debug!("peer {} destroyed while awaiting handshake", key);
                    wire.destroy();
                    return;
                }
            }
        }
    };
    match next {
        Err(_elapsed) => {
            log::info!("peer {} handshake timed out", key);
            wire.destroy();
            report(&swarm_tx, key, PeerEventKind::HandshakeTimedOut);
        }
        Ok(None) => {
            log::debug!("peer {} wire closed before handshake", key);
            wire.destroy();
            report(&swarm_tx, key, PeerEventKind::Terminated);
        }
        Ok(Some(WireEvent::Handshake {
            info_hash: remote_hash,
            peer_id,
            extensions,
        })) => {
            if remote_hash != info_hash {
                log::info!("peer {} sent mismatched info hash", key);
                wire.destroy();
                report(&swarm_tx, key, PeerEventKind::InfoHashMismatch);
                return;
            }
            log::info!("peer {} handshake ok", key);
            report(&swarm_tx, key, PeerEventKind::Active { peer_id, extensions });
            run_active(key, wire, events, swarm_tx, cmd_rx).await;
        }
        Ok(Some(_other)) => {
            log::info!("peer {} sent a non-handshake message first", key);
            wire.destroy();
            report(&swarm_tx, key, PeerEventKind::Terminated);
        }
    }
}

/// Spawns the task for a peer whose handshake the owning [`crate::pool::Pool`]
/// has already received and matched to this swarm's info hash.
pub(crate) fn spawn_inbound(
    key: PeerKey,
    info_hash: InfoHash,
    peer_id_local: PeerId,
    handshake_opts: HandshakeOpts,
    remote_peer_id: PeerId,
    extensions: [u8; 8],
    mut wire: Box<dyn Wire>,
    events: WireEventStream,
    swarm_tx: mpsc::UnboundedSender<Command>,
) -> mpsc::UnboundedSender<PeerCommand> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    wire.handshake(info_hash, peer_id_local, handshake_opts);
    report(&swarm_tx, key.clone(), PeerEventKind::Active {
        peer_id: remote_peer_id,
        extensions,
    });
    tokio::spawn(run_active(key, wire, events, swarm_tx, cmd_rx));
    cmd_tx
}

/// The shared relay loop for an active (post-handshake) peer: forwards
/// byte-counter events to the swarm and tears down on any terminal wire
/// event or an explicit [`PeerCommand::Destroy`].
async fn run_active(
    key: PeerKey,
    mut wire: Box<dyn Wire>,
    events: WireEventStream,
    swarm_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let mut events = events.fuse();
    let mut cmd_rx = cmd_rx.fuse();
    loop {
        select! {
            event = events.next() => {
                match event {
                    Some(WireEvent::Download(n)) => report(&swarm_tx, key.clone(), PeerEventKind::Download(n)),
                    Some(WireEvent::Upload(n)) => report(&swarm_tx, key.clone(), PeerEventKind::Upload(n)),
                    Some(WireEvent::Handshake { .. }) => {
                        log::warn!("peer {} sent a second handshake; ignoring", key);
                    }
                    Some(WireEvent::End)
                    | Some(WireEvent::Close)
                    | Some(WireEvent::Finish)
                    | None => {
                        log::info!("peer {} wire ended", key);
                        wire.destroy();
                        report(&swarm_tx, key, PeerEventKind::Terminated);
                        return;
                    }
                    Some(WireEvent::Error(e)) => {
                        log::info!("peer {} wire error: {}", key, e);
                        wire.destroy();
                        report(&swarm_tx, key, PeerEventKind::Terminated);
                        return;
                    }
                }
            }
            cmd = cmd_rx.next() => {
                match cmd {
                    Some(PeerCommand::Destroy) | None => {
                        log::debug!("peer {} destroyed", key);
                        wire.destroy();
                        return;
                    }
                }
            }
        }
    }
}

fn report(swarm_tx: &mpsc::UnboundedSender<Command>, key: PeerKey, kind: PeerEventKind) {
    let _ = swarm_tx.send(Command::PeerEvent(key, kind));
}
