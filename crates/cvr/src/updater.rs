use std::collections::BTreeSet;

use common::types::{
    ClientId,
    CvrVersion,
    QueryHash,
    ReplicaVersion,
    TransformationHash,
};
use common::value::RowKey;
use serde_json::Value as JsonValue;
use sync_types::{
    DesiredQueryPatchOp,
    QuerySpec,
};

use crate::model::{
    ClientRecord,
    Cvr,
    QueryRecord,
};

/// Replay log entry for the flush. Row mutations are not replayed op by op;
/// the flush writes the final state of every touched row instead.
#[derive(Clone, Debug)]
pub enum CvrOp {
    EnsureClient { client_id: ClientId },
    SetClientExpiry {
        client_id: ClientId,
        expires_at: Option<u64>,
    },
    SetLmid { client_id: ClientId, lmid: u64 },
    PutDesire { client_id: ClientId, hash: QueryHash },
    DelDesire { client_id: ClientId, hash: QueryHash },
    PutQuery {
        hash: QueryHash,
        spec: QuerySpec,
        ttl_ms: Option<u64>,
    },
    SetTransformation {
        hash: QueryHash,
        transformation_hash: TransformationHash,
    },
    MarkGotten { hash: QueryHash },
    /// Reset a query to its untransformed, not-gotten state. Used when a
    /// fresh view syncer instance adopts a persisted CVR: pipelines must be
    /// re-transformed and re-hydrated before the query counts as gotten
    /// again.
    ClearQueryState { hash: QueryHash },
    SetQueryExpiry {
        hash: QueryHash,
        expires_at: Option<u64>,
    },
    RemoveQuery { hash: QueryHash },
    RemoveClient { client_id: ClientId },
    SetClientSchema { schema: JsonValue },
}

/// Effective difference produced by applying a desired-queries patch.
/// Reapplying an already-applied patch yields an empty diff.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredQueriesDiff {
    pub added: Vec<(QueryHash, QuerySpec)>,
    pub removed: Vec<QueryHash>,
}

impl DesiredQueriesDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// An in-memory transaction over one CVR. Typed mutations accumulate into
/// a working copy plus a replay log; `CvrStore::flush` commits both
/// durably, guarded by the prior version.
pub struct CvrUpdater {
    pub(crate) prior_version: CvrVersion,
    pub(crate) cvr: Cvr,
    pub(crate) ops: Vec<CvrOp>,
    pub(crate) touched_rows: BTreeSet<RowKey>,
}

impl CvrUpdater {
    pub fn new(cvr: &Cvr) -> Self {
        Self {
            prior_version: cvr.version,
            cvr: cvr.clone(),
            ops: Vec::new(),
            touched_rows: BTreeSet::new(),
        }
    }

    /// The working copy, reflecting every mutation applied so far.
    pub fn cvr(&self) -> &Cvr {
        &self.cvr
    }

    pub fn prior_version(&self) -> CvrVersion {
        self.prior_version
    }

    pub fn version(&self) -> CvrVersion {
        self.cvr.version
    }

    pub fn has_changes(&self) -> bool {
        !self.ops.is_empty() || !self.touched_rows.is_empty()
    }

    pub fn ensure_client(&mut self, client_id: &ClientId) {
        if !self.cvr.clients.contains_key(client_id) {
            self.cvr
                .clients
                .insert(client_id.clone(), ClientRecord::default());
            self.ops.push(CvrOp::EnsureClient {
                client_id: client_id.clone(),
            });
        }
    }

    pub fn set_client_expiry(&mut self, client_id: &ClientId, expires_at: Option<u64>) {
        if let Some(client) = self.cvr.clients.get_mut(client_id) {
            if client.expires_at != expires_at {
                client.expires_at = expires_at;
                self.ops.push(CvrOp::SetClientExpiry {
                    client_id: client_id.clone(),
                    expires_at,
                });
            }
        }
    }

    pub fn set_lmid(&mut self, client_id: &ClientId, lmid: u64) {
        self.ensure_client(client_id);
        let client = self
            .cvr
            .clients
            .get_mut(client_id)
            .expect("client ensured above");
        if lmid > client.lmid {
            client.lmid = lmid;
            self.ops.push(CvrOp::SetLmid {
                client_id: client_id.clone(),
                lmid,
            });
        }
    }

    pub fn set_client_schema(&mut self, schema: JsonValue) {
        if self.cvr.client_schema.as_ref() != Some(&schema) {
            self.cvr.client_schema = Some(schema.clone());
            self.ops.push(CvrOp::SetClientSchema { schema });
        }
    }

    /// Apply a client's desired-queries patch, returning the effective diff.
    /// `default_ttl_ms` applies to put entries that carry no TTL.
    pub fn set_desired_queries(
        &mut self,
        client_id: &ClientId,
        patch: &[DesiredQueryPatchOp],
        default_ttl_ms: u64,
    ) -> DesiredQueriesDiff {
        self.ensure_client(client_id);
        let mut diff = DesiredQueriesDiff::default();
        for op in patch {
            match op {
                DesiredQueryPatchOp::Put {
                    hash,
                    query,
                    ttl_ms,
                } => {
                    if self.put_desire(client_id, hash, query, ttl_ms.or(Some(default_ttl_ms))) {
                        diff.added.push((hash.clone(), query.clone()));
                    }
                },
                DesiredQueryPatchOp::Del { hash } => {
                    if self.del_desire(client_id, hash) {
                        diff.removed.push(hash.clone());
                    }
                },
                DesiredQueryPatchOp::Clear => {
                    let desired: Vec<QueryHash> = self
                        .cvr
                        .clients
                        .get(client_id)
                        .map(|c| c.desired_queries.iter().cloned().collect())
                        .unwrap_or_default();
                    for hash in desired {
                        if self.del_desire(client_id, &hash) {
                            diff.removed.push(hash);
                        }
                    }
                },
            }
        }
        diff
    }

    fn put_desire(
        &mut self,
        client_id: &ClientId,
        hash: &QueryHash,
        spec: &QuerySpec,
        ttl_ms: Option<u64>,
    ) -> bool {
        if !self.cvr.queries.contains_key(hash) {
            self.cvr.queries.insert(
                hash.clone(),
                QueryRecord {
                    spec: spec.clone(),
                    transformation_hash: None,
                    gotten: false,
                    ttl_ms,
                    expires_at: None,
                    internal_ref_count: 0,
                },
            );
            self.ops.push(CvrOp::PutQuery {
                hash: hash.clone(),
                spec: spec.clone(),
                ttl_ms,
            });
        }
        let client = self
            .cvr
            .clients
            .get_mut(client_id)
            .expect("client ensured by caller");
        let newly_desired = client.desired_queries.insert(hash.clone());
        if newly_desired {
            self.ops.push(CvrOp::PutDesire {
                client_id: client_id.clone(),
                hash: hash.clone(),
            });
        }
        // A re-desired query stops aging out.
        if let Some(query) = self.cvr.queries.get_mut(hash) {
            if query.expires_at.is_some() {
                query.expires_at = None;
                self.ops.push(CvrOp::SetQueryExpiry {
                    hash: hash.clone(),
                    expires_at: None,
                });
            }
        }
        newly_desired
    }

    fn del_desire(&mut self, client_id: &ClientId, hash: &QueryHash) -> bool {
        let Some(client) = self.cvr.clients.get_mut(client_id) else {
            return false;
        };
        if !client.desired_queries.remove(hash) {
            return false;
        }
        self.ops.push(CvrOp::DelDesire {
            client_id: client_id.clone(),
            hash: hash.clone(),
        });
        true
    }

    /// Start TTL clocks for queries no client desires any more. Called once
    /// per coordinator tick with the current time.
    pub fn age_undesired_queries(&mut self, now_ms: u64) {
        let undesired: Vec<(QueryHash, Option<u64>)> = self
            .cvr
            .queries
            .iter()
            .filter(|(hash, q)| {
                q.expires_at.is_none()
                    && q.internal_ref_count == 0
                    && !self.cvr.clients.values().any(|c| c.desired_queries.contains(*hash))
            })
            .map(|(hash, q)| (hash.clone(), q.ttl_ms))
            .collect();
        for (hash, ttl_ms) in undesired {
            let expires_at = now_ms.saturating_add(ttl_ms.unwrap_or(0));
            if let Some(query) = self.cvr.queries.get_mut(&hash) {
                query.expires_at = Some(expires_at);
            }
            self.ops.push(CvrOp::SetQueryExpiry {
                hash,
                expires_at: Some(expires_at),
            });
        }
    }

    pub fn set_transformation(&mut self, hash: &QueryHash, transformation_hash: &TransformationHash) {
        let Some(query) = self.cvr.queries.get_mut(hash) else {
            return;
        };
        if query.transformation_hash.as_ref() == Some(transformation_hash) {
            return;
        }
        query.transformation_hash = Some(transformation_hash.clone());
        self.ops.push(CvrOp::SetTransformation {
            hash: hash.clone(),
            transformation_hash: transformation_hash.clone(),
        });
    }

    pub fn mark_gotten(&mut self, hash: &QueryHash) {
        let Some(query) = self.cvr.queries.get_mut(hash) else {
            return;
        };
        if !query.gotten {
            query.gotten = true;
            self.ops.push(CvrOp::MarkGotten { hash: hash.clone() });
        }
    }

    pub fn clear_query_state(&mut self, hash: &QueryHash) {
        let Some(query) = self.cvr.queries.get_mut(hash) else {
            return;
        };
        if query.transformation_hash.is_none() && !query.gotten {
            return;
        }
        query.transformation_hash = None;
        query.gotten = false;
        self.ops.push(CvrOp::ClearQueryState { hash: hash.clone() });
    }

    /// Record that `hash`'s result set gained an occurrence of the row.
    /// Returns true when the row was previously unreferenced by any query.
    pub fn add_row(
        &mut self,
        hash: &QueryHash,
        key: RowKey,
        row_version: ReplicaVersion,
        columns: BTreeSet<String>,
    ) -> bool {
        let row = self.cvr.rows.entry(key.clone()).or_default();
        let was_unreferenced = row.total_refs() == 0;
        *row.ref_counts.entry(hash.clone()).or_insert(0) += 1;
        row.row_version = row_version;
        row.columns.extend(columns);
        self.touched_rows.insert(key);
        was_unreferenced
    }

    /// Refresh a row's content without changing membership.
    pub fn update_row(&mut self, key: &RowKey, row_version: ReplicaVersion, columns: BTreeSet<String>) {
        if let Some(row) = self.cvr.rows.get_mut(key) {
            row.row_version = row_version;
            row.columns.extend(columns);
            self.touched_rows.insert(key.clone());
        }
    }

    /// Record that `hash`'s result set lost an occurrence of the row.
    /// Returns true when the row is now unreferenced and was removed.
    pub fn drop_row(&mut self, hash: &QueryHash, key: &RowKey) -> bool {
        let Some(row) = self.cvr.rows.get_mut(key) else {
            return false;
        };
        if let Some(count) = row.ref_counts.get_mut(hash) {
            *count -= 1;
            if *count <= 0 {
                row.ref_counts.remove(hash);
            }
        }
        self.touched_rows.insert(key.clone());
        if row.total_refs() <= 0 {
            self.cvr.rows.remove(key);
            return true;
        }
        false
    }

    /// Remove a query outright: its desires, its row references, and the
    /// record itself. Returns the rows that became unreferenced.
    pub fn remove_query(&mut self, hash: &QueryHash) -> Vec<RowKey> {
        let client_ids: Vec<ClientId> = self.cvr.clients.keys().cloned().collect();
        for client_id in client_ids {
            self.del_desire(&client_id, hash);
        }
        let referencing: Vec<RowKey> = self
            .cvr
            .rows
            .iter()
            .filter(|(_, row)| row.ref_counts.contains_key(hash))
            .map(|(key, _)| key.clone())
            .collect();
        let mut dropped = Vec::new();
        for key in referencing {
            let Some(row) = self.cvr.rows.get_mut(&key) else {
                continue;
            };
            row.ref_counts.remove(hash);
            self.touched_rows.insert(key.clone());
            if row.total_refs() <= 0 {
                self.cvr.rows.remove(&key);
                dropped.push(key);
            }
        }
        if self.cvr.queries.remove(hash).is_some() {
            self.ops.push(CvrOp::RemoveQuery { hash: hash.clone() });
        }
        dropped
    }

    /// Remove a client record entirely (deleteClients, or TTL expiry).
    pub fn remove_client(&mut self, client_id: &ClientId) {
        if self.cvr.clients.remove(client_id).is_none() {
            return;
        }
        self.ops.push(CvrOp::RemoveClient {
            client_id: client_id.clone(),
        });
    }

    /// Expunge expired queries and clients. Returns the removed query
    /// hashes so the caller can tear down pipelines.
    pub fn expire(&mut self, now_ms: u64) -> Vec<QueryHash> {
        let expired_clients: Vec<ClientId> = self
            .cvr
            .clients
            .iter()
            .filter(|(_, c)| c.expires_at.map(|at| at <= now_ms).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in expired_clients {
            self.remove_client(&client_id);
        }
        self.age_undesired_queries(now_ms);
        let expired_queries: Vec<QueryHash> = self
            .cvr
            .queries
            .iter()
            .filter(|(_, q)| {
                q.internal_ref_count == 0
                    && q.expires_at.map(|at| at <= now_ms).unwrap_or(false)
            })
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &expired_queries {
            self.remove_query(hash);
        }
        expired_queries
    }

    /// Bump the major version to a new replica version. The new version
    /// must be strictly ahead; no client ever sees a version decrease.
    pub fn advance_major(&mut self, to: ReplicaVersion) -> anyhow::Result<CvrVersion> {
        let next = self.cvr.version.advance_major(to.0);
        anyhow::ensure!(
            next > self.cvr.version,
            "CVR version went backwards: {} -> {}",
            self.cvr.version,
            next
        );
        self.cvr.version = next;
        Ok(next)
    }

    /// Metadata-only version bump.
    pub fn advance_minor(&mut self) -> CvrVersion {
        self.cvr.version = self.cvr.version.advance_minor();
        self.cvr.version
    }
}
