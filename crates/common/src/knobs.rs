//! Tunable limits and parameters for the view-sync backend.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each should have a comment explaining what it's for and the bounds
//! if applicable so an oncall engineer can adjust it safely.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::{
    env_config,
    env_config_opt,
};

/// Fraction of the total hydration time granted to a single pipeline
/// advancement before it is aborted with a reset signal. Calibration point:
/// a 1000ms hydration yields a 500ms advancement budget.
pub static ADVANCE_BUDGET_RATIO: LazyLock<f64> =
    LazyLock::new(|| env_config("ADVANCE_BUDGET_RATIO", 0.5));

/// Reserved replica table carrying per-client last-mutation-id bookkeeping.
/// Change-log entries for this table are never fed to query pipelines; they
/// surface as lastMutationIDChanges in pokes.
pub static LMID_TABLE: LazyLock<String> =
    LazyLock::new(|| env_config("LMID_TABLE", "_sync_clients".to_owned()));

/// Bound on each client handler's outbound poke queue. A client that falls
/// this far behind is disconnected as a slow consumer rather than allowed to
/// stall the pipeline.
pub static CLIENT_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("CLIENT_QUEUE_SIZE", 256));

/// Maximum number of row patches carried by a single pokePart message.
pub static POKE_PART_MAX_ROWS: LazyLock<usize> =
    LazyLock::new(|| env_config("POKE_PART_MAX_ROWS", 128));

/// Maximum encoded length of the Sec-WebSocket-Protocol initConnection
/// payload. Beyond this the client falls back to a bare auth token.
pub static MAX_HEADER_LENGTH: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_HEADER_LENGTH", 8 * 1024));

/// Deadline for one round trip to the out-of-process query resolver.
pub static TRANSFORMER_DEADLINE: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("TRANSFORMER_DEADLINE_MS", 5_000))
});

/// Default time-to-live for a query whose last desiring client has gone
/// away. Rows and pipeline stay warm for this long to absorb reconnects.
pub static DEFAULT_QUERY_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("DEFAULT_QUERY_TTL_MS", 300_000)));

/// How long a client entry survives in the CVR with no live connection.
pub static CLIENT_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("CLIENT_TTL_MS", 24 * 60 * 60 * 1000)));

/// Rows fetched per chunk when lazily reading the replica change log.
pub static CHANGE_LOG_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("CHANGE_LOG_CHUNK_SIZE", 128));

/// Admin password gating the inspector. Unset means the inspector rejects
/// every authenticate attempt outside development mode.
pub static ADMIN_PASSWORD: LazyLock<Option<String>> =
    LazyLock::new(|| env_config_opt("ADMIN_PASSWORD"));

/// Development mode bypasses inspector authentication.
pub static DEV_MODE: LazyLock<bool> = LazyLock::new(|| env_config("DEV_MODE", false));
