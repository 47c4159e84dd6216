//! The view syncer (C5) and inspector (C6).
//!
//! One [`ViewSyncer`] per client group runs as a single-threaded cooperative
//! coordinator: it owns the group's CVR, its pipeline driver and replica
//! snapshot, its transformer handle, and its connected client handlers. The
//! transport shell and the replicator talk to it only through channels.

mod auth_set;
mod client;
mod inspector;
mod metrics;
mod pokes;
mod syncer;

#[cfg(test)]
mod tests;

pub use auth_set::AdminAuthSet;
pub use client::{
    ClientHandle,
    ClientReceiver,
    CloseSignal,
};
pub use syncer::{
    SyncerRequest,
    ViewSyncer,
    ViewSyncerConfig,
    ViewSyncerHandle,
};
