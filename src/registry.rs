//! The process-wide (but never global) table of listening ports.
//!
//! Spec §9 calls out that the pool-per-port table must be an explicit,
//! constructible object rather than a `lazy_static`/`OnceCell` singleton, so
//! that tests can spin up independent registries. A [`PoolRegistry`] is
//! exactly that: a cheaply-cloneable handle over a shared, mutex-guarded
//! `port -> PoolHandle` map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::mpsc;

use crate::conf::{PoolConf, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};
use crate::error::{Error, Result};
use crate::pool::{self, PoolHandle};
use crate::swarm;
use crate::wire::WireFactory;
use crate::InfoHash;

/// A handle to the shared `port -> Pool` table.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    pools: Mutex<HashMap<u16, PoolHandle>>,
    /// Randomized once per registry so that repeated ephemeral `listen()`
    /// calls across a process don't all cluster on the same starting port.
    ephemeral_base: u16,
}

impl PoolRegistry {
    pub fn new() -> Self {
        let ephemeral_base = rand::thread_rng().gen_range(EPHEMERAL_PORT_MIN..EPHEMERAL_PORT_MAX);
        Self {
            inner: Arc::new(Inner {
                pools: Mutex::new(HashMap::new()),
                ephemeral_base,
            }),
        }
    }

    /// Registers `info_hash` for listening, binding a new pool if `port`
    /// (or, if `None`, some free ephemeral port) doesn't already have one.
    /// Returns the bound port and a handle to its pool.
    pub(crate) async fn add_swarm(
        &self,
        port: Option<u16>,
        info_hash: InfoHash,
        swarm_tx: mpsc::UnboundedSender<swarm::Command>,
        pool_conf: PoolConf,
        wire_factory: Arc<dyn WireFactory>,
    ) -> Result<(u16, PoolHandle)> {
        match port {
            Some(port) => {
                let mut handle = self.get_or_bind(port, &pool_conf, &wire_factory).await?;
                match handle.add_swarm(info_hash, swarm_tx.clone()).await {
                    Ok(()) => {}
                    Err(Error::Closed) => {
                        // the cached handle's actor had already shut down
                        // (raced an emptying-out pool); bind fresh and retry once.
                        let listener = pool::bind_with_retry(port, &pool_conf).await?;
                        handle = self.spawn_pool(port, listener, pool_conf, wire_factory);
                        handle.add_swarm(info_hash, swarm_tx).await?;
                    }
                    Err(e) => return Err(e),
                }
                Ok((port, handle))
            }
            None => {
                let (listener, port) = pool::bind_ephemeral(self.inner.ephemeral_base).await?;
                let handle = self.spawn_pool(port, listener, pool_conf, wire_factory);
                handle.add_swarm(info_hash, swarm_tx).await?;
                Ok((port, handle))
            }
        }
    }

    /// Deregisters `info_hash` from the pool listening on `port`. If that
    /// pool has no swarms left, its listener is closed and the registry
    /// forgets the port before this returns.
    pub(crate) async fn remove_swarm(&self, port: u16, info_hash: InfoHash) {
        let handle = self.inner.pools.lock().unwrap().get(&port).cloned();
        if let Some(handle) = handle {
            let was_last = handle.remove_swarm(info_hash).await;
            if was_last {
                self.inner.pools.lock().unwrap().remove(&port);
            }
        }
    }

    async fn get_or_bind(
        &self,
        port: u16,
        conf: &PoolConf,
        wire_factory: &Arc<dyn WireFactory>,
    ) -> Result<PoolHandle> {
        let cached = self.inner.pools.lock().unwrap().get(&port).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }
        let listener = pool::bind_with_retry(port, conf).await?;
        Ok(self.spawn_pool(port, listener, conf.clone(), wire_factory.clone()))
    }

    fn spawn_pool(
        &self,
        port: u16,
        listener: tokio::net::TcpListener,
        conf: PoolConf,
        wire_factory: Arc<dyn WireFactory>,
    ) -> PoolHandle {
        let handle = pool::spawn(port, listener, conf, wire_factory);
        self.inner.pools.lock().unwrap().insert(port, handle.clone());
        handle
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
