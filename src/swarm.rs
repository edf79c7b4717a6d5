//! The swarm actor: the single synchronization domain for one torrent's
//! connection pool.
//!
//! Every mutation of a swarm's peer table, queue, or pause state happens
//! inside one task, driven by [`Command`]s sent over an unbounded channel.
//! [`Swarm`] itself is just a cheap, `Clone`-able handle (command sender
//! plus a shared, atomics-backed [`SwarmStatus`] for lock-free reads of the
//! observable counters spec §6 lists) — the actual `_peers`/`_queue`/
//! `_paused` state never leaves the actor task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::addr::Addr;
use crate::conf::Conf;
use crate::peer::{self, PeerEventKind, PeerSlot};
use crate::registry::PoolRegistry;
use crate::speedometer::Speedometer;
use crate::wire::{HandshakeOpts, Wire, WireEventStream, WireFactory};
use crate::{InfoHash, PeerId, PeerKey};

/// Commands accepted by a swarm's actor task. Public API on [`Swarm`] is a
/// thin wrapper sending one of these; `PeerEvent`/`Incoming`/`Requeue` are
/// only ever sent by the crate's own peer/pool tasks.
pub enum Command {
    /// Queues an outbound peer at `addr` (`"host:port"`). Invalid addresses
    /// and duplicates of an already-known peer are silently dropped, per
    /// spec (logged, not surfaced as an error).
    Add(String),
    /// Removes a peer (queued, connecting, or active) by the same address
    /// text it was added with.
    Remove(String),
    Pause,
    Resume,
    /// Starts listening via the swarm's [`PoolRegistry`]. `None` picks a
    /// free ephemeral port.
    Listen(Option<u16>),
    /// Tears the whole swarm down: destroys every peer, deregisters from
    /// its pool if listening, emits [`SwarmEvent::Close`], and stops the
    /// actor task.
    Destroy,
    /// Reported by a peer task about itself.
    PeerEvent(PeerKey, PeerEventKind),
    /// A backoff timer elapsed; re-queue the peer for another dial attempt.
    Requeue(PeerKey),
    /// Handed off by a [`crate::pool::Pool`] once it has matched an
    /// incoming connection's handshake to this swarm's info hash.
    Incoming {
        key: PeerKey,
        wire: Box<dyn Wire>,
        events: WireEventStream,
        remote_peer_id: PeerId,
        extensions: [u8; 8],
    },
}

/// Events a swarm emits to whoever holds its [`SwarmEvents`] stream.
#[derive(Debug)]
pub enum SwarmEvent {
    Listening(u16),
    /// A peer completed its handshake and is now active.
    Wire {
        key: PeerKey,
        peer_id: PeerId,
        extensions: [u8; 8],
    },
    Download(u64),
    Upload(u64),
    Error(String),
    Close,
}

pub type SwarmEvents = mpsc::UnboundedReceiver<SwarmEvent>;

/// Lock-free (aside from the two speed estimators) observable counters,
/// shared between the actor and every clone of the [`Swarm`] handle. Mirrors
/// the derived-properties list in spec §6.
#[derive(Default)]
struct SwarmStatus {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    num_queued: AtomicUsize,
    num_conns: AtomicUsize,
    num_peers: AtomicUsize,
    port: AtomicU16,
    download_speed: Mutex<Speedometer>,
    upload_speed: Mutex<Speedometer>,
}

/// A cheaply-cloneable handle to a running swarm actor.
#[derive(Clone)]
pub struct Swarm {
    pub info_hash: InfoHash,
    cmd_tx: mpsc::UnboundedSender<Command>,
    status: Arc<SwarmStatus>,
}

impl Swarm {
    /// Spawns a swarm actor for `info_hash` and returns a handle to it along
    /// with its event stream.
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        handshake_opts: HandshakeOpts,
        conf: Arc<Conf>,
        registry: PoolRegistry,
        wire_factory: Arc<dyn WireFactory>,
    ) -> (Self, SwarmEvents) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(SwarmStatus::default());

        let actor = Actor {
            info_hash,
            peer_id,
            handshake_opts,
            conf,
            registry,
            wire_factory,
            status: status.clone(),
            events_tx,
            cmd_tx: cmd_tx.clone(),
            peers: HashMap::new(),
            queue: VecDeque::new(),
            wires: Vec::new(),
            paused: false,
            destroyed: false,
            listening_port: None,
        };
        tokio::spawn(actor.run(cmd_rx));

        (
            Self {
                info_hash,
                cmd_tx,
                status,
            },
            events_rx,
        )
    }

    pub fn add(&self, addr: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Add(addr.into()));
    }

    pub fn remove(&self, addr: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Remove(addr.into()));
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(Command::Resume);
    }

    /// Starts listening on `port` (or a free ephemeral port if `None`). The
    /// bound port is reported asynchronously as [`SwarmEvent::Listening`].
    pub fn listen(&self, port: Option<u16>) {
        let _ = self.cmd_tx.send(Command::Listen(port));
    }

    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }

    pub fn downloaded(&self) -> u64 {
        self.status.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.status.uploaded.load(Ordering::Relaxed)
    }

    /// `uploaded / downloaded`, or `0.0` before anything has downloaded.
    pub fn ratio(&self) -> f64 {
        let downloaded = self.downloaded();
        if downloaded == 0 {
            0.0
        } else {
            self.uploaded() as f64 / downloaded as f64
        }
    }

    pub fn num_queued(&self) -> usize {
        self.status.num_queued.load(Ordering::Relaxed)
    }

    pub fn num_conns(&self) -> usize {
        self.status.num_conns.load(Ordering::Relaxed)
    }

    pub fn num_peers(&self) -> usize {
        self.status.num_peers.load(Ordering::Relaxed)
    }

    /// The port last reported via [`SwarmEvent::Listening`], or `0` if the
    /// swarm isn't listening.
    pub fn port(&self) -> u16 {
        self.status.port.load(Ordering::Relaxed)
    }

    pub fn download_speed(&self) -> f64 {
        self.status.download_speed.lock().unwrap().rate()
    }

    pub fn upload_speed(&self) -> f64 {
        self.status.upload_speed.lock().unwrap().rate()
    }
}

/// The actor's private state; never accessed outside its own task.
struct Actor {
    info_hash: InfoHash,
    peer_id: PeerId,
    handshake_opts: HandshakeOpts,
    conf: Arc<Conf>,
    registry: PoolRegistry,
    wire_factory: Arc<dyn WireFactory>,
    status: Arc<SwarmStatus>,
    events_tx: mpsc::UnboundedSender<SwarmEvent>,
    /// Kept so the actor can hand its own sender to peer tasks and to
    /// schedule backoff requeues on itself.
    cmd_tx: mpsc::UnboundedSender<Command>,
    peers: HashMap<PeerKey, PeerSlot>,
    queue: VecDeque<PeerKey>,
    /// Keys of currently-active (handshaken) peers, in promotion order.
    wires: Vec<PeerKey>,
    paused: bool,
    destroyed: bool,
    /// Set to the bound port once `Listen` succeeds; used to deregister
    /// from the registry on destroy.
    listening_port: Option<u16>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            if self.handle(cmd).await {
                break;
            }
        }
        log::debug!("swarm {} actor stopped", self.info_hash);
    }

    /// Returns `true` once the actor should stop (only after `Destroy`).
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Add(text) => {
                self.on_add(text);
                self.drain();
            }
            Command::Remove(text) => {
                if let Ok(addr) = Addr::parse(&text) {
                    self.remove_peer(&PeerKey::Addr(addr.to_string()));
                    self.drain();
                }
            }
            Command::Pause => self.paused = true,
            Command::Resume => {
                self.paused = false;
                self.drain();
            }
            Command::Listen(port) => self.on_listen(port).await,
            Command::Destroy => {
                self.on_destroy().await;
                return true;
            }
            Command::PeerEvent(key, kind) => {
                self.on_peer_event(key, kind);
                self.drain();
            }
            Command::Requeue(key) => {
                if !self.destroyed {
                    if let Some(slot) = self.peers.get_mut(&key) {
                        slot.is_queued = true;
                        self.queue.push_back(key);
                        self.status.num_queued.store(self.queue.len(), Ordering::Relaxed);
                    }
                }
                self.drain();
            }
            Command::Incoming {
                key,
                wire,
                events,
                remote_peer_id,
                extensions,
            } => {
                self.on_incoming(key, wire, events, remote_peer_id, extensions);
            }
        }
        false
    }

    fn on_add(&mut self, text: String) {
        if self.destroyed {
            return;
        }
        let addr = match Addr::parse(&text) {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!("swarm {}: dropping invalid peer address {:?}: {}", self.info_hash, text, e);
                return;
            }
        };
        let key = PeerKey::Addr(addr.to_string());
        if self.peers.contains_key(&key) {
            log::debug!("swarm {}: peer {} already known, ignoring add", self.info_hash, key);
            return;
        }
        let mut slot = PeerSlot::new(key.clone());
        slot.addr = Some(addr);
        self.peers.insert(key.clone(), slot);
        self.queue.push_back(key);
        self.status.num_queued.store(self.queue.len(), Ordering::Relaxed);
    }

    /// Admission control: while under `max_conns` and not paused, dials the
    /// next queued peer. Called after every state change that could free or
    /// fill a slot.
    fn drain(&mut self) {
        if self.destroyed || self.paused {
            return;
        }
        while self.status.num_conns.load(Ordering::Relaxed) < self.conf.swarm.max_conns {
            let key = match self.queue.pop_front() {
                Some(key) => key,
                None => break,
            };
            self.status.num_queued.store(self.queue.len(), Ordering::Relaxed);

            let addr = match self.peers.get_mut(&key) {
                Some(slot) => {
                    slot.is_queued = false;
                    match slot.addr.clone() {
                        Some(addr) => addr,
                        None => continue,
                    }
                }
                // removed while queued (e.g. `remove` raced the dequeue).
                None => continue,
            };

            let cmd_tx = peer::spawn_outbound(
                key.clone(),
                addr,
                self.info_hash,
                self.peer_id,
                self.handshake_opts,
                self.conf.swarm.handshake_timeout_out,
                self.wire_factory.clone(),
                self.cmd_tx.clone(),
            );
            if let Some(slot) = self.peers.get_mut(&key) {
                slot.cmd_tx = Some(cmd_tx);
            }
            self.status.num_conns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_peer_event(&mut self, key: PeerKey, kind: PeerEventKind) {
        if self.destroyed {
            return;
        }
        match kind {
            PeerEventKind::Active { peer_id, extensions } => self.on_active(&key, peer_id, extensions),
            PeerEventKind::Download(n) => self.on_download(n),
            PeerEventKind::Upload(n) => self.on_upload(n),
            PeerEventKind::ConnectFailed
            | PeerEventKind::HandshakeTimedOut
            | PeerEventKind::InfoHashMismatch
            | PeerEventKind::Terminated => {
                self.on_terminal(&key);
            }
        }
    }

    /// Common bookkeeping for any way a peer's connection can end: frees its
    /// `num_conns`/`num_peers` accounting, then either reschedules it with
    /// backoff or destroys it for good.
    fn on_terminal(&mut self, key: &PeerKey) {
        let had_conn = match self.peers.get_mut(key) {
            Some(slot) => {
                let had_conn = slot.cmd_tx.take().is_some();
                if slot.is_active {
                    slot.is_active = false;
                    self.wires.retain(|k| k != key);
                    self.status.num_peers.store(self.wires.len(), Ordering::Relaxed);
                }
                had_conn
            }
            None => return,
        };
        if had_conn {
            self.status.num_conns.fetch_sub(1, Ordering::Relaxed);
        }
        self.schedule_retry_or_destroy(key);
    }

    fn schedule_retry_or_destroy(&mut self, key: &PeerKey) {
        let retries = match self.peers.get(key) {
            Some(slot) => slot.retries,
            None => return,
        };
        match self.conf.swarm.backoff_delay(retries) {
            Some(delay) => {
                if let Some(slot) = self.peers.get_mut(key) {
                    slot.retries += 1;
                }
                let cmd_tx = self.cmd_tx.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    tokio::time::delay_for(delay).await;
                    let _ = cmd_tx.send(Command::Requeue(key));
                });
            }
            None => {
                log::info!("swarm {}: peer {} exhausted its backoff schedule", self.info_hash, key);
                if let Some(mut slot) = self.peers.remove(key) {
                    slot.destroy();
                }
            }
        }
    }

    fn on_active(&mut self, key: &PeerKey, peer_id: PeerId, extensions: [u8; 8]) {
        if let Some(slot) = self.peers.get_mut(key) {
            slot.retries = 0;
            slot.is_active = true;
        } else {
            return;
        }
        self.wires.push(key.clone());
        self.status.num_peers.store(self.wires.len(), Ordering::Relaxed);
        let _ = self.events_tx.send(SwarmEvent::Wire {
            key: key.clone(),
            peer_id,
            extensions,
        });
    }

    fn on_download(&mut self, n: u64) {
        self.status.downloaded.fetch_add(n, Ordering::Relaxed);
        self.status.download_speed.lock().unwrap().update(n);
        let _ = self.events_tx.send(SwarmEvent::Download(n));
    }

    fn on_upload(&mut self, n: u64) {
        self.status.uploaded.fetch_add(n, Ordering::Relaxed);
        self.status.upload_speed.lock().unwrap().update(n);
        let _ = self.events_tx.send(SwarmEvent::Upload(n));
    }

    fn on_incoming(
        &mut self,
        key: PeerKey,
        mut wire: Box<dyn Wire>,
        events: WireEventStream,
        remote_peer_id: PeerId,
        extensions: [u8; 8],
    ) {
        if self.destroyed || self.peers.contains_key(&key) {
            // already have this peer (or we're tearing down): the pool
            // handed us a connection we don't want, so destroy it ourselves.
            wire.destroy();
            return;
        }
        let mut slot = PeerSlot::new(key.clone());
        slot.is_queued = false;
        // so a later disconnect can schedule a normal backoff redial instead
        // of getting stuck with no dial target (`drain` skips `addr: None`).
        if let PeerKey::Addr(text) = &key {
            slot.addr = Addr::parse(text).ok();
        }
        self.peers.insert(key.clone(), slot);
        self.status.num_conns.fetch_add(1, Ordering::Relaxed);

        let cmd_tx = peer::spawn_inbound(
            key.clone(),
            self.info_hash,
            self.peer_id,
            self.handshake_opts,
            remote_peer_id,
            extensions,
            wire,
            events,
            self.cmd_tx.clone(),
        );
        if let Some(slot) = self.peers.get_mut(&key) {
            slot.cmd_tx = Some(cmd_tx);
        }
    }

    fn remove_peer(&mut self, key: &PeerKey) {
        if let Some(mut slot) = self.peers.remove(key) {
            self.queue.retain(|k| k != key);
            self.status.num_queued.store(self.queue.len(), Ordering::Relaxed);
            if slot.is_active {
                self.wires.retain(|k| k != key);
                self.status.num_peers.store(self.wires.len(), Ordering::Relaxed);
            }
            if slot.cmd_tx.is_some() {
                self.status.num_conns.fetch_sub(1, Ordering::Relaxed);
            }
            slot.destroy();
        }
    }

    async fn on_listen(&mut self, port: Option<u16>) {
        if self.destroyed || self.listening_port.is_some() {
            return;
        }
        let result = self
            .registry
            .add_swarm(
                port,
                self.info_hash,
                self.cmd_tx.clone(),
                self.conf.pool.clone(),
                self.wire_factory.clone(),
            )
            .await;
        match result {
            Ok((bound_port, _pool)) => {
                self.listening_port = Some(bound_port);
                self.status.port.store(bound_port, Ordering::Relaxed);
                let _ = self.events_tx.send(SwarmEvent::Listening(bound_port));
            }
            Err(e) => {
                log::warn!("swarm {}: failed to listen: {}", self.info_hash, e);
                let _ = self.events_tx.send(SwarmEvent::Error(e.to_string()));
            }
        }
    }

    async fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        log::info!("swarm {}: destroying", self.info_hash);
        let keys: Vec<PeerKey> = self.peers.keys().cloned().collect();
        for key in keys {
            self.remove_peer(&key);
        }
        if let Some(port) = self.listening_port.take() {
            self.registry.remove_swarm(port, self.info_hash).await;
        }
        let _ = self.events_tx.send(SwarmEvent::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::mock::MockWireFactory;
    use crate::wire::WireEvent;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn bind_unaccepted() -> (tokio::net::TcpListener, std::net::SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn outbound_peer_reaches_active_and_reports_bytes() {
        // the real TCP connect must land somewhere; the wire/handshake atop
        // it is what's mocked.
        let (_listener, addr) = bind_unaccepted().await;

        let info_hash = InfoHash::new([7u8; 20]);
        let wire_factory = Arc::new(MockWireFactory::new());
        let (swarm, mut events) = Swarm::new(
            info_hash,
            PeerId::new([1u8; 20]),
            HandshakeOpts::default(),
            Arc::new(Conf::default()),
            PoolRegistry::new(),
            wire_factory.clone(),
        );

        swarm.add(addr.to_string());

        let remote_id = PeerId::new([2u8; 20]);
        let controller = wire_factory.nth(0).await;
        controller.remote_handshake(info_hash, remote_id);

        match events.recv().await.unwrap() {
            SwarmEvent::Wire { peer_id, .. } => assert_eq!(peer_id, remote_id),
            other => panic!("expected Wire event, got {:?}", other),
        }
        assert_eq!(swarm.num_peers(), 1);
        assert_eq!(swarm.num_conns(), 1);
        assert_eq!(swarm.num_queued(), 0);

        controller.emit(WireEvent::Download(1024));
        match events.recv().await.unwrap() {
            SwarmEvent::Download(n) => assert_eq!(n, 1024),
            other => panic!("expected Download event, got {:?}", other),
        }
        assert_eq!(swarm.downloaded(), 1024);
        assert!(swarm.download_speed() > 0.0);
    }

    #[tokio::test]
    async fn duplicate_add_for_a_known_peer_is_ignored() {
        let (_listener, addr) = bind_unaccepted().await;
        let info_hash = InfoHash::new([8u8; 20]);
        let wire_factory = Arc::new(MockWireFactory::new());
        let (swarm, _events) = Swarm::new(
            info_hash,
            PeerId::new([1u8; 20]),
            HandshakeOpts::default(),
            Arc::new(Conf::default()),
            PoolRegistry::new(),
            wire_factory,
        );

        swarm.add(addr.to_string());
        swarm.add(addr.to_string());
        tokio::time::delay_for(Duration::from_millis(20)).await;

        assert_eq!(swarm.num_conns() + swarm.num_queued(), 1);
    }

    #[tokio::test]
    async fn cap_enforcement_queues_peers_past_max_conns() {
        let (_listener_a, addr_a) = bind_unaccepted().await;
        let (_listener_b, addr_b) = bind_unaccepted().await;

        let mut conf = Conf::default();
        conf.swarm.max_conns = 1;

        let info_hash = InfoHash::new([9u8; 20]);
        let wire_factory = Arc::new(MockWireFactory::new());
        let (swarm, _events) = Swarm::new(
            info_hash,
            PeerId::new([1u8; 20]),
            HandshakeOpts::default(),
            Arc::new(conf),
            PoolRegistry::new(),
            wire_factory,
        );

        swarm.add(addr_a.to_string());
        swarm.add(addr_b.to_string());
        tokio::time::delay_for(Duration::from_millis(20)).await;

        assert_eq!(swarm.num_conns(), 1);
        assert_eq!(swarm.num_queued(), 1);
    }

    #[tokio::test]
    async fn destroy_tears_down_queued_and_active_peers() {
        let (_listener, addr) = bind_unaccepted().await;
        let info_hash = InfoHash::new([10u8; 20]);
        let wire_factory = Arc::new(MockWireFactory::new());
        let (swarm, mut events) = Swarm::new(
            info_hash,
            PeerId::new([1u8; 20]),
            HandshakeOpts::default(),
            Arc::new(Conf::default()),
            PoolRegistry::new(),
            wire_factory.clone(),
        );

        swarm.add(addr.to_string());
        let controller = wire_factory.nth(0).await;
        controller.remote_handshake(info_hash, PeerId::new([2u8; 20]));
        let _ = events.recv().await.unwrap(); // Wire

        swarm.destroy();
        match events.recv().await.unwrap() {
            SwarmEvent::Close => {}
            other => panic!("expected Close event, got {:?}", other),
        }
        tokio::time::delay_for(Duration::from_millis(20)).await;
        assert!(controller.is_destroyed());
        assert_eq!(swarm.num_peers(), 0);
    }

    #[tokio::test]
    async fn inbound_peer_is_demuxed_to_the_right_swarm() {
        let wire_factory = Arc::new(MockWireFactory::new());
        let registry = PoolRegistry::new();
        let conf = Arc::new(Conf::default());

        let hash_a = InfoHash::new([0xAA; 20]);
        let hash_b = InfoHash::new([0xBB; 20]);
        let (swarm_a, mut events_a) = Swarm::new(
            hash_a,
            PeerId::new([1u8; 20]),
            HandshakeOpts::default(),
            conf.clone(),
            registry.clone(),
            wire_factory.clone(),
        );
        let (swarm_b, mut events_b) = Swarm::new(
            hash_b,
            PeerId::new([2u8; 20]),
            HandshakeOpts::default(),
            conf,
            registry,
            wire_factory.clone(),
        );

        swarm_a.listen(None);
        let port = match events_a.recv().await.unwrap() {
            SwarmEvent::Listening(p) => p,
            other => panic!("expected Listening event, got {:?}", other),
        };

        swarm_b.listen(Some(port));
        match events_b.recv().await.unwrap() {
            SwarmEvent::Listening(p) => assert_eq!(p, port),
            other => panic!("expected Listening event, got {:?}", other),
        }

        let _client = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let remote_id = PeerId::new([3u8; 20]);
        let controller = wire_factory.nth(0).await;
        controller.remote_handshake(hash_b, remote_id);

        match events_b.recv().await.unwrap() {
            SwarmEvent::Wire { peer_id, .. } => assert_eq!(peer_id, remote_id),
            other => panic!("expected Wire event on swarm_b, got {:?}", other),
        }
        assert_eq!(swarm_b.num_peers(), 1);
        assert_eq!(swarm_a.num_peers(), 0);
    }
}
