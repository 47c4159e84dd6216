//! Client view records (C4).
//!
//! A CVR is the durable record of what rows each client of a client group
//! believes it has, per query. The store persists CVRs in its own SQLite
//! database (distinct from the replica); the view syncer owns the in-memory
//! copy and is the single writer for its group. Flushes are optimistic:
//! a flush whose prior version no longer matches the persisted value fails
//! with [`CvrConflict`] and the caller reloads and retries once.

mod model;
mod store;
mod updater;

pub use model::{
    ClientRecord,
    Cvr,
    QueryRecord,
    RowRecord,
};
pub use store::{
    CvrStore,
    InspectQueryRecord,
};
pub use updater::{
    CvrOp,
    CvrUpdater,
    DesiredQueriesDiff,
};

use common::types::{
    ClientGroupId,
    CvrVersion,
};

/// Optimistic concurrency failure: some other writer advanced the persisted
/// CVR underneath this updater.
#[derive(thiserror::Error, Debug)]
#[error("CVR conflict for {client_group_id}: expected version {expected}, found {found}")]
pub struct CvrConflict {
    pub client_group_id: ClientGroupId,
    pub expected: CvrVersion,
    pub found: CvrVersion,
}
