//! Protocol constants and tuning defaults.
//!
//! Everything tunable here is only a default: the values flow into
//! [`SwarmConfig`](crate::config::SwarmConfig) and
//! [`EngineConfig`](crate::config::EngineConfig), which are what the engine
//! actually reads at run time.
//!
//! Defaults follow the usual choices of mainstream clients (libtorrent,
//! Transmission, qBittorrent) scaled down where the engine keeps less state.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-BS0100-";

// ============================================================================
// Ports
// ============================================================================

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum concurrent connections per torrent
pub const MAX_CONNECTIONS_PER_TORRENT: usize = 50;

/// Candidates kept waiting for a free connection slot
pub const MAX_PENDING_CANDIDATES: usize = 256;

/// Peers unchoked by rank each choking round (the optimistic slot is extra)
pub const UNCHOKE_SLOTS: usize = 4;

/// Outstanding block requests per connection.
/// 16 x 16 KiB keeps a 256 KiB window open, enough for most links.
pub const PIPELINE_DEPTH: usize = 16;

/// Peers that may hold the same block in flight during end-game
pub const MAX_ENDGAME_OWNERS: usize = 2;

/// Swarm events buffered for slow subscribers
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length per BEP 3 (128KB). Larger requests are a violation.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Completion ratio at which end-game duplication is allowed
pub const ENDGAME_THRESHOLD: f64 = 0.95;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connect plus handshake budget
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound silence (keep-alives included) after which a peer is dropped
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket write timeout for a single frame
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Intervals
// ============================================================================

/// Choking algorithm run interval
pub const CHOKING_INTERVAL: Duration = Duration::from_secs(10);

/// Optimistic unchoke rotation interval
pub const OPTIMISTIC_UNCHOKE_INTERVAL: Duration = Duration::from_secs(30);

/// Keepalive message interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic request refill for connections that went quiet
pub const REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Default announce interval towards discovery collaborators
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// An address is not dialed again within this window
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Window of the exponentially decayed transfer rate meters
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

// ============================================================================
// Buffer sizes
// ============================================================================

/// Initial read buffer per connection (32KB)
pub const READ_BUFFER_SIZE: usize = 32768;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16777216;

// ============================================================================
// Storage
// ============================================================================

/// Pieces hashed concurrently during a recheck
pub const RECHECK_BATCH_SIZE: usize = 32;

/// Open file handles idle longer than this are closed
pub const FILE_HANDLE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
