//! Incremental view maintenance (C2).
//!
//! The driver owns one pipeline per transformation hash. Each pipeline
//! materializes its query's sorted row windows against the current replica
//! snapshot and maps change-log entries to row-level output changes.
//! Advancement is bounded: a budget derived from total hydration time caps
//! how long one advancement may run before the driver poisons itself and
//! demands a reset.

mod driver;
mod eval;
mod metrics;
mod node;
mod sql;
mod timer;

#[cfg(test)]
mod tests;

pub use driver::{
    Advancement,
    PipelineDriver,
};
pub use eval::eval_condition;
pub use node::RowChange;
pub use sql::hydration_plan;
pub use timer::{
    AdvanceTimer,
    ScriptedTimer,
    WallClockTimer,
};

use common::types::{
    QueryHash,
    ReplicaVersion,
    TransformationHash,
};

/// The driver exceeded its advancement budget and its pipelines can no
/// longer be trusted. The caller must `reset` and re-hydrate every query.
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct ResetPipelinesSignal {
    pub message: String,
}

/// `advance` was handed a change interval that does not start at the
/// driver's current version.
#[derive(thiserror::Error, Debug)]
#[error("Snapshot stale: driver at {current}, advance starts at {from}")]
pub struct SnapshotStale {
    pub current: ReplicaVersion,
    pub from: ReplicaVersion,
}

/// One output change, annotated with the pipeline that produced it and the
/// query ids fanned out from its transformation hash.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineChange {
    pub transformation_hash: TransformationHash,
    pub query_ids: Vec<QueryHash>,
    pub change: RowChange,
}
