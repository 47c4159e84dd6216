//! Materialized state for one query pipeline.
//!
//! A query AST compiles to a tree of [`NodeState`]s: the root node holds a
//! single window of rows; each related sub-query node holds one window per
//! parent row, keyed by the parent's row key and located through a
//! correlation index. Windows are sorted by the node's order-by columns with
//! the primary key as tiebreak, and bounded by the node's limit.

use std::{
    cmp::Ordering,
    collections::{
        BTreeMap,
        BTreeSet,
    },
};

use anyhow::Context as _;
use common::{
    query::{
        Ast,
        Condition,
        Correlation,
        Direction,
        OrderPart,
    },
    value::{
        RowData,
        RowKey,
        SqlValue,
    },
};
use replica::{
    ChangeLogEntry,
    Snapshot,
};

use crate::{
    eval::eval_condition,
    sql::build_select,
};

/// Row-level output of a pipeline. `Add`/`Remove` change view membership
/// (and therefore CVR refcounts); `Update` refreshes content for a row
/// already in the view.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    Add { key: RowKey, row: RowData },
    Update { key: RowKey, row: RowData },
    Remove { key: RowKey },
}

impl RowChange {
    pub fn key(&self) -> &RowKey {
        match self {
            RowChange::Add { key, .. }
            | RowChange::Update { key, .. }
            | RowChange::Remove { key } => key,
        }
    }
}

/// Sort atom honoring the column's direction: descending atoms reverse
/// their comparison so windows can live in ordinary BTreeMaps.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Atom {
    Asc(SqlValue),
    Desc(SqlValue),
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Atom::Asc(a), Atom::Asc(b)) => a.cmp(b),
            (Atom::Desc(a), Atom::Desc(b)) => b.cmp(a),
            // Atoms at one position always share a direction; order the
            // mismatch arbitrarily but totally.
            (Atom::Asc(..), Atom::Desc(..)) => Ordering::Less,
            (Atom::Desc(..), Atom::Asc(..)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    atoms: Vec<Atom>,
    pk: Vec<SqlValue>,
}

#[derive(Clone, Debug)]
struct RowMeta {
    order_key: OrderKey,
    /// Parent-side correlation values for each child node, captured at
    /// materialization time so child-table changes resolve affected parents
    /// without rescanning.
    child_corr_values: Vec<Vec<SqlValue>>,
}

#[derive(Clone, Debug, Default)]
struct Window {
    /// Correlation value binding this window to its parent row. Empty for
    /// the root window.
    corr_value: Vec<SqlValue>,
    rows: BTreeMap<OrderKey, RowKey>,
    by_key: BTreeMap<RowKey, RowMeta>,
}

impl Window {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn last_key(&self) -> Option<&OrderKey> {
        self.rows.keys().next_back()
    }
}

/// `None` keys the root's single window; `Some(parent)` keys a related
/// node's window under that parent row.
type ParentKey = Option<RowKey>;

pub(crate) struct NodeState {
    table: String,
    where_clause: Option<Condition>,
    order_by: Vec<OrderPart>,
    limit: Option<u64>,
    correlation: Option<Correlation>,
    windows: BTreeMap<ParentKey, Window>,
    /// Parent-side correlation value -> parent rows with a window here.
    corr_index: BTreeMap<Vec<SqlValue>, BTreeSet<RowKey>>,
    children: Vec<NodeState>,
}

impl NodeState {
    pub(crate) fn build(ast: &Ast, correlation: Option<Correlation>) -> Self {
        Self {
            table: ast.table.clone(),
            where_clause: ast.where_clause.clone(),
            order_by: ast.order_by.clone(),
            limit: ast.limit,
            correlation,
            windows: BTreeMap::new(),
            corr_index: BTreeMap::new(),
            children: ast
                .related
                .iter()
                .map(|r| NodeState::build(&r.sub_query, Some(r.correlation.clone())))
                .collect(),
        }
    }

    fn order_key(&self, row: &RowData, key: &RowKey) -> OrderKey {
        let atoms = self
            .order_by
            .iter()
            .map(|part| {
                let value = row.get(&part.column).cloned().unwrap_or(SqlValue::Null);
                match part.dir {
                    Direction::Asc => Atom::Asc(value),
                    Direction::Desc => Atom::Desc(value),
                }
            })
            .collect();
        OrderKey {
            atoms,
            pk: key.pk.clone(),
        }
    }

    /// Parent-side correlation values this row contributes, one per child.
    fn child_corr_values(&self, row: &RowData) -> Vec<Vec<SqlValue>> {
        self.children
            .iter()
            .map(|child| {
                let correlation = child
                    .correlation
                    .as_ref()
                    .expect("related nodes always carry a correlation");
                correlation
                    .parent_fields
                    .iter()
                    .map(|field| row.get(field).cloned().unwrap_or(SqlValue::Null))
                    .collect()
            })
            .collect()
    }

    /// Child-side correlation value of a row of this node's table.
    fn own_corr_value(&self, row: &RowData) -> Option<Vec<SqlValue>> {
        self.correlation.as_ref().map(|correlation| {
            correlation
                .child_fields
                .iter()
                .map(|field| row.get(field).cloned().unwrap_or(SqlValue::Null))
                .collect()
        })
    }

    fn row_in_window(&self, row: &RowData, window: &Window) -> bool {
        if let Some(where_clause) = &self.where_clause {
            if !eval_condition(where_clause, row) {
                return false;
            }
        }
        match self.own_corr_value(row) {
            // Root window: membership is the filter alone.
            None => true,
            Some(value) => {
                !value.iter().any(SqlValue::is_null) && value == window.corr_value
            },
        }
    }

    /// Materialize one window instance and emit its rows (and descendants)
    /// in hydration order.
    pub(crate) fn hydrate_instance(
        &mut self,
        snapshot: &Snapshot,
        parent: ParentKey,
        corr_value: Vec<SqlValue>,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        let correlation_eq: Vec<(String, SqlValue)> = match &self.correlation {
            None => vec![],
            Some(correlation) => correlation
                .child_fields
                .iter()
                .cloned()
                .zip(corr_value.iter().cloned())
                .collect(),
        };
        let pk_cols = snapshot.pk_columns(&self.table)?;
        let (sql, params) = build_select(
            &self.table,
            self.where_clause.as_ref(),
            &correlation_eq,
            &self.order_by,
            &pk_cols,
            self.limit,
        );
        let rows = snapshot.select(&sql, &params)?;

        if let Some(parent_key) = &parent {
            self.corr_index
                .entry(corr_value.clone())
                .or_default()
                .insert(parent_key.clone());
        }
        self.windows.insert(
            parent.clone(),
            Window {
                corr_value,
                ..Window::default()
            },
        );
        for row in rows {
            self.insert_row(snapshot, &parent, row, out)?;
        }
        Ok(())
    }

    /// Insert a row known to belong to the window; emits the add and
    /// hydrates child windows beneath it.
    fn insert_row(
        &mut self,
        snapshot: &Snapshot,
        parent: &ParentKey,
        row: RowData,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        let key = snapshot.row_key(&self.table, &row)?;
        let order_key = self.order_key(&row, &key);
        let child_corr_values = self.child_corr_values(&row);
        let window = self
            .windows
            .get_mut(parent)
            .context("Window missing for insert")?;
        if window.by_key.contains_key(&key) {
            return Ok(());
        }
        window.rows.insert(order_key.clone(), key.clone());
        window.by_key.insert(
            key.clone(),
            RowMeta {
                order_key,
                child_corr_values: child_corr_values.clone(),
            },
        );
        out.push(RowChange::Add {
            key: key.clone(),
            row,
        });
        for (child, corr_value) in self.children.iter_mut().zip(child_corr_values) {
            child.hydrate_instance(snapshot, Some(key.clone()), corr_value, out)?;
        }
        Ok(())
    }

    /// Remove a row from the window, emitting its removal and tearing down
    /// descendant windows.
    fn remove_row(&mut self, parent: &ParentKey, key: &RowKey, out: &mut Vec<RowChange>) {
        let Some(window) = self.windows.get_mut(parent) else {
            return;
        };
        let Some(meta) = window.by_key.remove(key) else {
            return;
        };
        window.rows.remove(&meta.order_key);
        out.push(RowChange::Remove { key: key.clone() });
        for (child, corr_value) in self.children.iter_mut().zip(meta.child_corr_values) {
            child.drop_instance(&Some(key.clone()), &corr_value, out);
        }
    }

    /// Tear down one window instance entirely.
    fn drop_instance(
        &mut self,
        parent: &ParentKey,
        corr_value: &[SqlValue],
        out: &mut Vec<RowChange>,
    ) {
        let Some(window) = self.windows.remove(parent) else {
            return;
        };
        if let Some(parent_key) = parent {
            if let Some(parents) = self.corr_index.get_mut(corr_value) {
                parents.remove(parent_key);
                if parents.is_empty() {
                    self.corr_index.remove(corr_value);
                }
            }
        }
        for (key, meta) in window.by_key {
            out.push(RowChange::Remove { key: key.clone() });
            for (child, child_corr) in self.children.iter_mut().zip(meta.child_corr_values) {
                child.drop_instance(&Some(key.clone()), &child_corr, out);
            }
        }
    }

    /// Read this node's current result set from the snapshot without
    /// touching materialized state: the rows a freshly-joining query with
    /// the same transformation already has. Matches hydration order.
    pub(crate) fn collect_rows(
        &self,
        snapshot: &Snapshot,
        corr_value: Vec<SqlValue>,
        out: &mut Vec<(RowKey, RowData)>,
    ) -> anyhow::Result<()> {
        let correlation_eq: Vec<(String, SqlValue)> = match &self.correlation {
            None => vec![],
            Some(correlation) => correlation
                .child_fields
                .iter()
                .cloned()
                .zip(corr_value.into_iter())
                .collect(),
        };
        let pk_cols = snapshot.pk_columns(&self.table)?;
        let (sql, params) = build_select(
            &self.table,
            self.where_clause.as_ref(),
            &correlation_eq,
            &self.order_by,
            &pk_cols,
            self.limit,
        );
        for row in snapshot.select(&sql, &params)? {
            let key = snapshot.row_key(&self.table, &row)?;
            let child_corr_values = self.child_corr_values(&row);
            out.push((key, row.clone()));
            for (child, child_corr) in self.children.iter().zip(child_corr_values) {
                child.collect_rows(snapshot, child_corr, out)?;
            }
        }
        Ok(())
    }

    /// Feed one change-log entry to this node and its descendants.
    pub(crate) fn apply_change(
        &mut self,
        snapshot: &Snapshot,
        entry: &ChangeLogEntry,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        if entry.key.table == self.table {
            self.apply_to_windows(snapshot, entry, out)?;
        }
        for child in &mut self.children {
            child.apply_change(snapshot, entry, out)?;
        }
        Ok(())
    }

    fn apply_to_windows(
        &mut self,
        snapshot: &Snapshot,
        entry: &ChangeLogEntry,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        let mut affected: BTreeSet<ParentKey> = BTreeSet::new();
        match &self.correlation {
            None => {
                affected.insert(None);
            },
            Some(_) => {
                for row in [entry.prev_row.as_ref(), entry.new_row.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    if let Some(value) = self.own_corr_value(row) {
                        if let Some(parents) = self.corr_index.get(&value) {
                            affected.extend(parents.iter().cloned().map(Some));
                        }
                    }
                }
            },
        }
        for parent in affected {
            self.apply_in_window(snapshot, &parent, entry, out)?;
        }
        Ok(())
    }

    fn apply_in_window(
        &mut self,
        snapshot: &Snapshot,
        parent: &ParentKey,
        entry: &ChangeLogEntry,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        // Capture everything needed from the window before mutating.
        let (present, matches_new, window_was_full, last_key, old_meta) = {
            let Some(window) = self.windows.get(parent) else {
                return Ok(());
            };
            let matches_new = entry
                .new_row
                .as_ref()
                .map(|row| self.row_in_window(row, window))
                .unwrap_or(false);
            (
                window.by_key.contains_key(&entry.key),
                matches_new,
                self.limit
                    .map(|limit| window.len() as u64 >= limit)
                    .unwrap_or(false),
                window.last_key().cloned(),
                window.by_key.get(&entry.key).cloned(),
            )
        };

        match (present, matches_new) {
            (false, false) => {},
            (false, true) => {
                let row = entry.new_row.clone().context("Matching change lost its row")?;
                let order_key = self.order_key(&row, &entry.key);
                if window_was_full {
                    let beyond_window = last_key.map(|last| order_key > last).unwrap_or(false);
                    if beyond_window {
                        return Ok(());
                    }
                }
                self.insert_row(snapshot, parent, row, out)?;
                self.evict_overflow(parent, out);
            },
            (true, false) => {
                self.remove_row(parent, &entry.key, out);
                if window_was_full {
                    self.refill_window(snapshot, parent, out)?;
                }
            },
            (true, true) => {
                let row = entry.new_row.clone().context("Matching change lost its row")?;
                let order_key = self.order_key(&row, &entry.key);
                let old_meta = old_meta.context("Present row missing meta")?;
                if old_meta.order_key != order_key {
                    // The row moved in the sort order. Replay the insertion
                    // path, then recompute the window if it was bounded:
                    // a row that slid past the boundary must make room for
                    // whichever row slid in.
                    self.remove_row(parent, &entry.key, out);
                    self.apply_in_window(snapshot, parent, entry, out)?;
                    if window_was_full {
                        self.refill_window(snapshot, parent, out)?;
                    }
                    return Ok(());
                }
                let new_child_corr = self.child_corr_values(&row);
                let old_child_corr = old_meta.child_corr_values;
                out.push(RowChange::Update {
                    key: entry.key.clone(),
                    row,
                });
                if new_child_corr != old_child_corr {
                    // Correlation values moved; rebind affected children.
                    for (i, (old, new)) in
                        old_child_corr.iter().zip(new_child_corr.iter()).enumerate()
                    {
                        if old != new {
                            self.children[i].drop_instance(&Some(entry.key.clone()), old, out);
                            self.children[i].hydrate_instance(
                                snapshot,
                                Some(entry.key.clone()),
                                new.clone(),
                                out,
                            )?;
                        }
                    }
                    if let Some(window) = self.windows.get_mut(parent) {
                        if let Some(meta) = window.by_key.get_mut(&entry.key) {
                            meta.child_corr_values = new_child_corr;
                        }
                    }
                }
            },
        }
        Ok(())
    }

    fn evict_overflow(&mut self, parent: &ParentKey, out: &mut Vec<RowChange>) {
        let Some(limit) = self.limit else {
            return;
        };
        loop {
            let evict = {
                let Some(window) = self.windows.get(parent) else {
                    return;
                };
                if window.len() as u64 <= limit {
                    return;
                }
                window
                    .rows
                    .values()
                    .next_back()
                    .cloned()
            };
            match evict {
                Some(key) => self.remove_row(parent, &key, out),
                None => return,
            }
        }
    }

    /// Recompute a bounded window from the snapshot and add back any rows
    /// that slid into view.
    fn refill_window(
        &mut self,
        snapshot: &Snapshot,
        parent: &ParentKey,
        out: &mut Vec<RowChange>,
    ) -> anyhow::Result<()> {
        let correlation_eq: Vec<(String, SqlValue)> = {
            let Some(window) = self.windows.get(parent) else {
                return Ok(());
            };
            match &self.correlation {
                None => vec![],
                Some(correlation) => correlation
                    .child_fields
                    .iter()
                    .cloned()
                    .zip(window.corr_value.iter().cloned())
                    .collect(),
            }
        };
        let pk_cols = snapshot.pk_columns(&self.table)?;
        let (sql, params) = build_select(
            &self.table,
            self.where_clause.as_ref(),
            &correlation_eq,
            &self.order_by,
            &pk_cols,
            self.limit,
        );
        for row in snapshot.select(&sql, &params)? {
            let key = snapshot.row_key(&self.table, &row)?;
            let already_present = self
                .windows
                .get(parent)
                .map(|w| w.by_key.contains_key(&key))
                .unwrap_or(false);
            if !already_present {
                self.insert_row(snapshot, parent, row, out)?;
            }
        }
        self.evict_overflow(parent, out);
        Ok(())
    }
}

/// One pipeline: the compiled node tree plus fan-out bookkeeping.
pub(crate) struct PipelineState {
    pub(crate) ast: Ast,
    pub(crate) root: NodeState,
    pub(crate) query_ids: BTreeSet<common::types::QueryHash>,
    pub(crate) hydration_time: std::time::Duration,
}

impl PipelineState {
    pub(crate) fn new(ast: Ast) -> Self {
        let root = NodeState::build(&ast, None);
        Self {
            ast,
            root,
            query_ids: BTreeSet::new(),
            hydration_time: std::time::Duration::ZERO,
        }
    }

    pub(crate) fn touches_table(&self, table: &str) -> bool {
        self.ast.touched_tables().contains(&table)
    }
}
