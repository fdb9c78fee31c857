//! Engine and swarm configuration.
//!
//! Configuration is an explicit value handed to [`Engine::bind`] and
//! [`Swarm::new`]; nothing is read from globals. Loading these values from
//! files or the environment is left to the embedding application.
//!
//! # Examples
//!
//! ```
//! use btswarm::config::{EngineConfig, SwarmConfig};
//! use std::time::Duration;
//!
//! let swarm = SwarmConfig::default()
//!     .with_pipeline_depth(32)
//!     .with_choke_interval(Duration::from_secs(5));
//! assert!(swarm.validate().is_ok());
//!
//! let engine = EngineConfig::default().with_swarm(swarm);
//! assert_eq!(engine.swarm.pipeline_depth, 32);
//! ```
//!
//! [`Engine::bind`]: crate::engine::Engine::bind
//! [`Swarm::new`]: crate::swarm::Swarm::new

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    ANNOUNCE_INTERVAL, BLOCK_SIZE, CHOKING_INTERVAL, DEFAULT_PORT, ENDGAME_THRESHOLD,
    HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEPALIVE_INTERVAL, MAX_CONNECTIONS_PER_TORRENT,
    MAX_REQUEST_LENGTH, OPTIMISTIC_UNCHOKE_INTERVAL, PIPELINE_DEPTH, RECONNECT_BACKOFF,
    REQUEST_INTERVAL, UNCHOKE_SLOTS,
};

/// Errors reported by [`SwarmConfig::validate`] and [`EngineConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("block size must be between 1 and {max} bytes, got {got}")]
    BlockSize { got: u32, max: u32 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("end-game threshold must be within 0.0..=1.0, got {0}")]
    EndgameThreshold(f64),

    #[error("keep-alive interval ({keepalive:?}) must be shorter than the idle timeout ({idle:?})")]
    KeepaliveTooLong { keepalive: Duration, idle: Duration },

    #[error("encrypted connections are required but only plaintext framing is available")]
    EncryptionUnavailable,
}

/// How the peer wire channel may be protected.
///
/// The engine frames messages over an opaque ordered byte stream and ships
/// only the plaintext stream. `PreferEncrypted` therefore degrades to
/// plaintext, and `RequireEncrypted` is rejected during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    RequirePlaintext,
    #[default]
    PreferEncrypted,
    RequireEncrypted,
}

/// Per-torrent tuning of the swarm engine.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Size of a wire request. The last block of a piece may be shorter.
    pub block_size: u32,
    /// Maximum outstanding requests per connection.
    pub pipeline_depth: usize,
    /// Maximum concurrent peer connections for the torrent.
    pub max_connections: usize,
    /// Peers unchoked by rank each choking round (K).
    pub unchoke_slots: usize,
    /// Interval between choking rounds.
    pub choke_interval: Duration,
    /// Interval between optimistic unchoke rotations.
    pub optimistic_unchoke_interval: Duration,
    /// Completion ratio from which duplicate end-game requests are allowed.
    pub endgame_threshold: f64,
    /// A connection that receives nothing for this long is closed.
    pub idle_timeout: Duration,
    /// Interval for our own keep-alive messages.
    pub keepalive_interval: Duration,
    /// Budget for TCP connect plus handshake.
    pub handshake_timeout: Duration,
    /// Interval of the periodic request refill.
    pub request_interval: Duration,
    /// Interval of announces to discovery collaborators.
    pub announce_interval: Duration,
    /// Re-supplied addresses are ignored for this long after an attempt.
    pub reconnect_backoff: Duration,
    /// Hash existing data at start so complete pieces are not downloaded again.
    pub verify_on_start: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            pipeline_depth: PIPELINE_DEPTH,
            max_connections: MAX_CONNECTIONS_PER_TORRENT,
            unchoke_slots: UNCHOKE_SLOTS,
            choke_interval: CHOKING_INTERVAL,
            optimistic_unchoke_interval: OPTIMISTIC_UNCHOKE_INTERVAL,
            endgame_threshold: ENDGAME_THRESHOLD,
            idle_timeout: IDLE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            request_interval: REQUEST_INTERVAL,
            announce_interval: ANNOUNCE_INTERVAL,
            reconnect_backoff: RECONNECT_BACKOFF,
            verify_on_start: true,
        }
    }
}

impl SwarmConfig {
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_unchoke_slots(mut self, slots: usize) -> Self {
        self.unchoke_slots = slots;
        self
    }

    pub fn with_choke_interval(mut self, interval: Duration) -> Self {
        self.choke_interval = interval;
        self
    }

    pub fn with_optimistic_unchoke_interval(mut self, interval: Duration) -> Self {
        self.optimistic_unchoke_interval = interval;
        self
    }

    pub fn with_endgame_threshold(mut self, threshold: f64) -> Self {
        self.endgame_threshold = threshold;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_verify_on_start(mut self, verify: bool) -> Self {
        self.verify_on_start = verify;
        self
    }

    /// Checks that every option is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > MAX_REQUEST_LENGTH {
            return Err(ConfigError::BlockSize {
                got: self.block_size,
                max: MAX_REQUEST_LENGTH,
            });
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::Zero("pipeline_depth"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        if !(0.0..=1.0).contains(&self.endgame_threshold) {
            return Err(ConfigError::EndgameThreshold(self.endgame_threshold));
        }

        let intervals = [
            ("choke_interval", self.choke_interval),
            ("optimistic_unchoke_interval", self.optimistic_unchoke_interval),
            ("idle_timeout", self.idle_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("request_interval", self.request_interval),
            ("announce_interval", self.announce_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.keepalive_interval >= self.idle_timeout {
            return Err(ConfigError::KeepaliveTooLong {
                keepalive: self.keepalive_interval,
                idle: self.idle_timeout,
            });
        }

        Ok(())
    }
}

/// Configuration of an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address of the inbound peer listener. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Channel protection policy for peer connections.
    pub encryption_policy: EncryptionPolicy,
    /// Defaults applied to every torrent added without its own configuration.
    pub swarm: SwarmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            encryption_policy: EncryptionPolicy::default(),
            swarm: SwarmConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_encryption_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption_policy = policy;
        self
    }

    pub fn with_swarm(mut self, swarm: SwarmConfig) -> Self {
        self.swarm = swarm;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption_policy == EncryptionPolicy::RequireEncrypted {
            return Err(ConfigError::EncryptionUnavailable);
        }
        self.swarm.validate()
    }
}
