//! This module defines types used to configure the swarm manager and its
//! parts.

use std::time::Duration;

/// The hard cap on simultaneous connections a single swarm maintains. This is
/// the only fairness/rate-limiting policy the core implements.
pub const MAX_CONNS: usize = 100;

/// How long an outbound dial has to complete the handshake before it's
/// treated as dead. Outgoing peers dialed us to them, so we give them more
/// time than incoming peers to show intent.
pub const HANDSHAKE_TIMEOUT_OUT: Duration = Duration::from_secs(25);

/// How long an incoming connection has to complete the handshake. Incoming
/// peers have already "spoken" TCP-wise (they connected to us), so they must
/// show intent quickly.
pub const HANDSHAKE_TIMEOUT_IN: Duration = Duration::from_secs(5);

/// Number of times a [`crate::pool::Pool`] retries binding its listener on
/// `EADDRINUSE` before giving up.
pub const BIND_RETRIES: usize = 5;

/// Delay between bind retries.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The fixed, bounded sequence of delays used between successive
/// reconnection attempts. Exhausting the schedule is terminal: the peer is
/// destroyed rather than re-queued.
pub const BACKOFF_MS: &[u64] = &[
    1_000, 5_000, 15_000, 30_000, 60_000, 120_000, 300_000, 600_000,
];

/// Lower bound (inclusive) of the range an ephemeral port base is chosen
/// from.
pub const EPHEMERAL_PORT_MIN: u16 = 1025;

/// Upper bound (inclusive) of the range an ephemeral port base is chosen
/// from.
pub const EPHEMERAL_PORT_MAX: u16 = 61025;

/// Configuration for a single swarm.
#[derive(Clone, Debug)]
pub struct SwarmConf {
    /// The max number of simultaneous connections the swarm allows.
    pub max_conns: usize,
    /// Deadline for an outbound dial to complete its handshake.
    pub handshake_timeout_out: Duration,
    /// Reconnect backoff schedule, in order of increasing retry count.
    pub backoff: Vec<Duration>,
}

impl SwarmConf {
    /// Returns the delay for the given (zero-based) retry count, or `None`
    /// if the schedule is exhausted and the peer should be destroyed
    /// permanently instead of re-queued.
    pub fn backoff_delay(&self, retries: usize) -> Option<Duration> {
        self.backoff.get(retries).copied()
    }
}

impl Default for SwarmConf {
    fn default() -> Self {
        Self {
            max_conns: MAX_CONNS,
            handshake_timeout_out: HANDSHAKE_TIMEOUT_OUT,
            backoff: BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }
}

/// Configuration for a [`crate::pool::Pool`] (shared by every swarm
/// registered on the same port).
#[derive(Clone, Debug)]
pub struct PoolConf {
    /// Deadline for an incoming connection to complete its handshake.
    pub handshake_timeout_in: Duration,
    /// Number of bind retries on `EADDRINUSE`.
    pub bind_retries: usize,
    /// Delay between bind retries.
    pub bind_retry_delay: Duration,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            handshake_timeout_in: HANDSHAKE_TIMEOUT_IN,
            bind_retries: BIND_RETRIES,
            bind_retry_delay: BIND_RETRY_DELAY,
        }
    }
}

/// The aggregate configuration a swarm and the pool it registers with share.
#[derive(Clone, Debug, Default)]
pub struct Conf {
    pub swarm: SwarmConf,
    pub pool: PoolConf,
}

impl Conf {
    /// Returns the configuration with the defaults listed in this module's
    /// constants.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_terminal() {
        let conf = SwarmConf::default();
        assert_eq!(conf.backoff.len(), BACKOFF_MS.len());
        assert_eq!(conf.backoff_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(
            conf.backoff_delay(BACKOFF_MS.len() - 1),
            Some(Duration::from_secs(600))
        );
        assert_eq!(conf.backoff_delay(BACKOFF_MS.len()), None);
    }
}
