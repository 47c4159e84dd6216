use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    time::Duration,
};

use anyhow::Context as _;
use common::{
    knobs::{
        ADVANCE_BUDGET_RATIO,
        LMID_TABLE,
    },
    query::Ast,
    types::{
        QueryHash,
        ReplicaVersion,
        TransformationHash,
    },
};
use replica::{
    ChangeLog,
    ChangeLogEntry,
    Snapshot,
};

use crate::{
    metrics,
    node::{
        PipelineState,
        RowChange,
    },
    timer::AdvanceTimer,
    PipelineChange,
    ResetPipelinesSignal,
    SnapshotStale,
};

/// Owns every pipeline for one view syncer, keyed by transformation hash.
/// Not thread-safe: the coordinator serializes all calls.
pub struct PipelineDriver {
    snapshot: Option<Snapshot>,
    pipelines: BTreeMap<TransformationHash, PipelineState>,
    query_index: BTreeMap<QueryHash, TransformationHash>,
    total_hydration: Duration,
    poisoned: bool,
}

impl PipelineDriver {
    pub fn new() -> Self {
        Self {
            snapshot: None,
            pipelines: BTreeMap::new(),
            query_index: BTreeMap::new(),
            total_hydration: Duration::ZERO,
            poisoned: false,
        }
    }

    /// Bind the driver to its initial snapshot. Idempotent only for the
    /// same version.
    pub fn init(&mut self, snapshot: Snapshot) -> anyhow::Result<()> {
        if let Some(current) = &self.snapshot {
            anyhow::ensure!(
                current.version() == snapshot.version(),
                "init called with a different snapshot: {} != {}",
                current.version(),
                snapshot.version()
            );
            return Ok(());
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn version(&self) -> Option<ReplicaVersion> {
        self.snapshot.as_ref().map(|s| s.version())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn has_pipeline(&self, hash: &TransformationHash) -> bool {
        self.pipelines.contains_key(hash)
    }

    pub fn transformations(&self) -> Vec<TransformationHash> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn ast(&self, hash: &TransformationHash) -> Option<&Ast> {
        self.pipelines.get(hash).map(|p| &p.ast)
    }

    pub fn query_ids(&self, hash: &TransformationHash) -> Vec<QueryHash> {
        self.pipelines
            .get(hash)
            .map(|p| p.query_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_hydration_time(&self) -> Duration {
        self.total_hydration
    }

    /// Instantiate (or join) the pipeline for a transformation hash. The
    /// first caller hydrates and receives the initial `+row` changes in
    /// hydration order; later callers joining the same transformation get
    /// no changes, only fan-out bookkeeping.
    pub fn add_query(
        &mut self,
        transformation_hash: &TransformationHash,
        query_id: &QueryHash,
        ast: &Ast,
        timer: &dyn AdvanceTimer,
    ) -> anyhow::Result<Vec<RowChange>> {
        anyhow::ensure!(!self.poisoned, "Driver is poisoned; reset required");
        if let Some(pipeline) = self.pipelines.get_mut(transformation_hash) {
            pipeline.query_ids.insert(query_id.clone());
            self.query_index
                .insert(query_id.clone(), transformation_hash.clone());
            return Ok(vec![]);
        }
        let snapshot = self
            .snapshot
            .as_ref()
            .context("Driver has no snapshot; call init first")?;
        let started = timer.total_elapsed();
        let mut pipeline = PipelineState::new(ast.clone());
        let mut changes = Vec::new();
        pipeline
            .root
            .hydrate_instance(snapshot, None, vec![], &mut changes)?;
        let hydration_time = timer.total_elapsed().saturating_sub(started);
        pipeline.hydration_time = hydration_time;
        pipeline.query_ids.insert(query_id.clone());
        self.total_hydration += hydration_time;
        metrics::log_hydration(hydration_time);
        self.query_index
            .insert(query_id.clone(), transformation_hash.clone());
        self.pipelines
            .insert(transformation_hash.clone(), pipeline);
        tracing::debug!(
            "Hydrated pipeline {transformation_hash} with {} rows in {hydration_time:?}",
            changes.len()
        );
        Ok(changes)
    }

    /// The full current result set of a running pipeline, in hydration
    /// order. Used when a second query joins an existing transformation and
    /// its CVR entries must be seeded with the rows the pipeline already
    /// materialized.
    pub fn current_rows(
        &self,
        transformation_hash: &TransformationHash,
    ) -> anyhow::Result<Vec<(common::value::RowKey, common::value::RowData)>> {
        let pipeline = self
            .pipelines
            .get(transformation_hash)
            .with_context(|| format!("No pipeline for {transformation_hash}"))?;
        let snapshot = self
            .snapshot
            .as_ref()
            .context("Driver has no snapshot; call init first")?;
        let mut out = Vec::new();
        pipeline.root.collect_rows(snapshot, vec![], &mut out)?;
        Ok(out)
    }

    /// Drop one query id's interest; destroys the pipeline when the last
    /// id is removed. Returns the transformation hash if it was torn down.
    pub fn remove_query(&mut self, query_id: &QueryHash) -> Option<TransformationHash> {
        let transformation_hash = self.query_index.remove(query_id)?;
        let Some(pipeline) = self.pipelines.get_mut(&transformation_hash) else {
            return None;
        };
        pipeline.query_ids.remove(query_id);
        if pipeline.query_ids.is_empty() {
            let pipeline = self
                .pipelines
                .remove(&transformation_hash)
                .expect("pipeline present above");
            self.total_hydration = self
                .total_hydration
                .saturating_sub(pipeline.hydration_time);
            return Some(transformation_hash);
        }
        None
    }

    /// Swap in the successor snapshot and stream every change-log entry
    /// through the active pipelines. The returned advancement is a lazy,
    /// non-restartable sequence; dropping it before exhaustion poisons the
    /// driver.
    pub fn advance<'a>(
        &'a mut self,
        snapshot: Snapshot,
        from_version: ReplicaVersion,
        changes: ChangeLog,
        timer: &'a dyn AdvanceTimer,
    ) -> anyhow::Result<Advancement<'a>> {
        anyhow::ensure!(!self.poisoned, "Driver is poisoned; reset required");
        let current = self
            .version()
            .context("Driver has no snapshot; call init first")?;
        if current != from_version {
            return Err(SnapshotStale {
                current,
                from: from_version,
            }
            .into());
        }
        let to_version = snapshot.version();
        anyhow::ensure!(
            to_version > from_version,
            "Advance must move forward: {from_version} -> {to_version}"
        );
        let budget = if self.total_hydration.is_zero() {
            Duration::MAX
        } else {
            self.total_hydration.mul_f64(*ADVANCE_BUDGET_RATIO)
        };
        self.snapshot = Some(snapshot);
        let total = changes.total();
        Ok(Advancement {
            driver: self,
            input: changes,
            from_version,
            to_version,
            budget,
            timer,
            pending: VecDeque::new(),
            lmid_entries: Vec::new(),
            processed: 0,
            total,
            emitted: 0,
            failed: false,
            exhausted: false,
        })
    }

    /// Tear down all pipelines and release the snapshot. The caller
    /// re-inits and rebuilds every active query from scratch afterwards.
    pub fn reset(&mut self, reason: &str) {
        tracing::warn!("Resetting pipelines: {reason}");
        metrics::log_reset();
        self.pipelines.clear();
        self.query_index.clear();
        self.total_hydration = Duration::ZERO;
        self.snapshot = None;
        self.poisoned = false;
    }

    fn apply_entry(&mut self, entry: &ChangeLogEntry) -> anyhow::Result<Vec<PipelineChange>> {
        let snapshot = self
            .snapshot
            .as_ref()
            .context("Driver lost its snapshot mid-advance")?;
        let mut out = Vec::new();
        for (hash, pipeline) in self.pipelines.iter_mut() {
            if !pipeline.touches_table(&entry.key.table) {
                continue;
            }
            let mut changes = Vec::new();
            pipeline.root.apply_change(snapshot, entry, &mut changes)?;
            let query_ids: Vec<QueryHash> = pipeline.query_ids.iter().cloned().collect();
            for change in changes {
                out.push(PipelineChange {
                    transformation_hash: hash.clone(),
                    query_ids: query_ids.clone(),
                    change,
                });
            }
        }
        Ok(out)
    }
}

impl Default for PipelineDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy output of one `advance` call. Drain fully before asking for the
/// intercepted client-bookkeeping entries; dropping it early poisons the
/// driver so the coordinator resets instead of silently losing changes.
pub struct Advancement<'a> {
    driver: &'a mut PipelineDriver,
    input: ChangeLog,
    from_version: ReplicaVersion,
    to_version: ReplicaVersion,
    budget: Duration,
    timer: &'a dyn AdvanceTimer,
    pending: VecDeque<PipelineChange>,
    lmid_entries: Vec<ChangeLogEntry>,
    processed: usize,
    total: usize,
    emitted: u64,
    failed: bool,
    exhausted: bool,
}

impl std::fmt::Debug for Advancement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advancement")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("processed", &self.processed)
            .field("total", &self.total)
            .field("emitted", &self.emitted)
            .field("failed", &self.failed)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl Advancement<'_> {
    pub fn from_version(&self) -> ReplicaVersion {
        self.from_version
    }

    pub fn to_version(&self) -> ReplicaVersion {
        self.to_version
    }

    fn check_budget(&mut self) -> Result<(), ResetPipelinesSignal> {
        let elapsed = self.timer.total_elapsed();
        if elapsed <= self.budget {
            return Ok(());
        }
        self.failed = true;
        self.driver.poisoned = true;
        Err(ResetPipelinesSignal {
            message: format!(
                "Advancement exceeded timeout at {} of {} changes after {} ms. Advancement \
                 time limited base on total hydration time of {} ms.",
                self.processed,
                self.total,
                elapsed.as_millis(),
                self.driver.total_hydration.as_millis(),
            ),
        })
    }

    fn next_change(&mut self) -> Option<anyhow::Result<PipelineChange>> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(change) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(change));
            }
            if let Err(signal) = self.check_budget() {
                return Some(Err(signal.into()));
            }
            let entry = match self.input.next() {
                None => {
                    self.exhausted = true;
                    metrics::log_changes(self.emitted);
                    return None;
                },
                Some(Err(e)) => {
                    self.failed = true;
                    self.driver.poisoned = true;
                    return Some(Err(e));
                },
                Some(Ok(entry)) => entry,
            };
            self.processed += 1;
            if entry.key.table == *LMID_TABLE {
                // Client-bookkeeping rows never reach pipelines; they become
                // lastMutationIDChanges in the poke.
                self.lmid_entries.push(entry);
                continue;
            }
            match self.driver.apply_entry(&entry) {
                Ok(changes) => self.pending.extend(changes),
                Err(e) => {
                    self.failed = true;
                    self.driver.poisoned = true;
                    return Some(Err(e));
                },
            }
        }
    }

    /// The intercepted client-bookkeeping entries. Only meaningful after
    /// the sequence has been drained.
    pub fn into_lmid_entries(mut self) -> Vec<ChangeLogEntry> {
        std::mem::take(&mut self.lmid_entries)
    }
}

impl Iterator for Advancement<'_> {
    type Item = anyhow::Result<PipelineChange>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_change()
    }
}

impl Drop for Advancement<'_> {
    fn drop(&mut self) {
        if !self.exhausted && !self.failed {
            // Discarding an advancement mid-stream abandons changes; demand
            // a reset rather than silently diverging.
            self.driver.poisoned = true;
        }
    }
}
