//! Read-only access to the replica: consistent snapshots at a known version
//! and lazy change-log reads between versions.
//!
//! The replica file is written only by the replication ingest (out of
//! process). Snapshots are cheap to open but pin WAL pages while held, so
//! each coordinator holds at most one at a time.

mod change_log;
mod snapshot;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use change_log::{
    ChangeLog,
    ChangeLogEntry,
    ChangeOp,
};
pub use snapshot::{
    sql_value_from_sqlite,
    sql_value_to_sqlite,
    Snapshot,
};

use common::types::ReplicaVersion;

/// The replica file is corrupt or its version table is unreadable. Fatal to
/// the instance; the caller does not retry.
#[derive(thiserror::Error, Debug)]
#[error("Replica unavailable: {0}")]
pub struct ReplicaUnavailable(pub String);

#[derive(Debug)]
pub enum AdvanceResult {
    /// The replica has not moved since the previous snapshot.
    SameVersion,
    Advanced {
        snapshot: Snapshot,
        from_version: ReplicaVersion,
        to_version: ReplicaVersion,
        changes: ChangeLog,
    },
}

/// Opens snapshots of the replica on demand.
pub struct Snapshotter {
    path: std::path::PathBuf,
}

impl Snapshotter {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open a fresh read-only snapshot at the replica's current version.
    pub fn current(&self) -> anyhow::Result<Snapshot> {
        Snapshot::open(&self.path)
            .map_err(|e| ReplicaUnavailable(format!("{e:#}")).into())
    }

    /// Open a successor snapshot if the replica has advanced past `prev`,
    /// along with the ordered change-log rows in `(prev, next]`.
    pub fn advance(&self, prev: &Snapshot) -> anyhow::Result<AdvanceResult> {
        let next = self.current()?;
        let from_version = prev.version();
        let to_version = next.version();
        if to_version == from_version {
            return Ok(AdvanceResult::SameVersion);
        }
        anyhow::ensure!(
            to_version > from_version,
            "Replica version moved backwards: {from_version} -> {to_version}"
        );
        let changes = ChangeLog::open(&self.path, from_version, to_version)?;
        Ok(AdvanceResult::Advanced {
            snapshot: next,
            from_version,
            to_version,
            changes,
        })
    }
}
