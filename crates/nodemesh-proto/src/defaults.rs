//! Tunable operational defaults for nodemesh.
//!
//! Protocol-level values (reserved object ids, lock categories) live next
//! to the types that use them. This module centralizes the timings and
//! sizes that can be overridden via CLI flags or `CoordinatorConfig`.

// ─── Network / Port Defaults ────────────────────────────────────────────────

/// Default port on which peers connect to this node.
pub const DEFAULT_PEER_PORT: u16 = 47624;

/// Default bind address for the peer listener.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

// ─── Lock Negotiation ───────────────────────────────────────────────────────

/// Time a lock negotiation waits for ratification before activating
/// unilaterally (milliseconds).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

// ─── Peer Discovery ─────────────────────────────────────────────────────────

/// Delay before the first peer refresh after start-up (milliseconds).
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 5_000;

/// Period of the heartbeat + discovery cycle that refreshes this node's
/// record and opens or refreshes peer sessions (seconds).
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 60;

/// Maximum random jitter applied to each discovery cycle (milliseconds, +/-).
pub const DEFAULT_HEARTBEAT_JITTER_MS: u64 = 5_000;

/// How long an accepted peer link may stay silent before logging on
/// (milliseconds).
pub const DEFAULT_LOGON_TIMEOUT_MS: u64 = 10_000;

/// A node record is stale once this many discovery periods pass without
/// a heartbeat.
pub const DEFAULT_STALE_MULTIPLE: u32 = 5;

// ─── Scheduled Jobs ─────────────────────────────────────────────────────────

/// Nominal period of the cron ticker (milliseconds).
pub const DEFAULT_CRON_TICK_MS: u64 = 61_000;

/// Random amount subtracted from each cron tick (milliseconds), so that the
/// cluster's lock lottery is desynchronized.
pub const DEFAULT_CRON_JITTER_MS: u64 = 2_000;

/// Number of minutes in a day.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

// ─── Channels / Wire ────────────────────────────────────────────────────────

/// Maximum size of a single peer wire frame (bytes). 8 MB.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Channel buffer size for the per-link outbound message queue.
pub const DEFAULT_LINK_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for the accept queue of a peer listener.
pub const DEFAULT_ACCEPT_CHANNEL_SIZE: usize = 64;
