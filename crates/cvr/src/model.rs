use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::types::{
    ClientGroupId,
    ClientId,
    CvrVersion,
    QueryHash,
    ReplicaVersion,
    TransformationHash,
};
use common::value::RowKey;
use serde_json::Value as JsonValue;
use sync_types::QuerySpec;

/// One client's entry in the CVR. Survives reconnects until its TTL lapses.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientRecord {
    pub desired_queries: BTreeSet<QueryHash>,
    /// Epoch millis after which the client entry may be expunged. `None`
    /// while a connection is live.
    pub expires_at: Option<u64>,
    /// Last mutation id acknowledged to this client.
    pub lmid: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryRecord {
    pub spec: QuerySpec,
    /// Set once the query has been transformed; pipelines key off this.
    pub transformation_hash: Option<TransformationHash>,
    /// True only after initial hydration completed and the flush carrying
    /// those rows committed.
    pub gotten: bool,
    pub ttl_ms: Option<u64>,
    /// Epoch millis after which an undesired query is garbage collected.
    /// `None` while some client still desires it.
    pub expires_at: Option<u64>,
    /// References held by the server itself (eg in-flight hydration), which
    /// keep the query alive independently of clients.
    pub internal_ref_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowRecord {
    pub ref_counts: BTreeMap<QueryHash, i64>,
    pub columns: BTreeSet<String>,
    pub row_version: ReplicaVersion,
}

impl RowRecord {
    pub fn total_refs(&self) -> i64 {
        self.ref_counts.values().sum()
    }
}

/// The in-memory CVR for one client group. Mutated only through a
/// [`crate::CvrUpdater`] owned by the group's view syncer.
#[derive(Clone, Debug, PartialEq)]
pub struct Cvr {
    pub client_group_id: ClientGroupId,
    pub version: CvrVersion,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    pub rows: BTreeMap<RowKey, RowRecord>,
    pub client_schema: Option<JsonValue>,
}

impl Cvr {
    pub fn new(client_group_id: ClientGroupId) -> Self {
        Self {
            client_group_id,
            version: CvrVersion::initial(),
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            rows: BTreeMap::new(),
            client_schema: None,
        }
    }

    /// Queries desired by the given client.
    pub fn desired_queries(&self, client_id: &ClientId) -> BTreeSet<QueryHash> {
        self.clients
            .get(client_id)
            .map(|c| c.desired_queries.clone())
            .unwrap_or_default()
    }

    /// Every query hash mapped to the given transformation hash.
    pub fn queries_for_transformation(
        &self,
        transformation_hash: &TransformationHash,
    ) -> Vec<QueryHash> {
        self.queries
            .iter()
            .filter(|(_, q)| q.transformation_hash.as_ref() == Some(transformation_hash))
            .map(|(hash, _)| hash.clone())
            .collect()
    }

    /// Whether any client desires the query.
    pub fn is_desired(&self, hash: &QueryHash) -> bool {
        self.clients.values().any(|c| c.desired_queries.contains(hash))
    }

    /// Does this client currently see the given row through any of its
    /// desired queries?
    pub fn client_sees_row(&self, client_id: &ClientId, key: &RowKey) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        let Some(row) = self.rows.get(key) else {
            return false;
        };
        client
            .desired_queries
            .iter()
            .any(|q| row.ref_counts.get(q).copied().unwrap_or(0) > 0)
    }

    /// Structural invariants (spec'd in the data model): every row entry has
    /// positive total refcount and every refcount key names a live query.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (key, row) in &self.rows {
            anyhow::ensure!(
                row.total_refs() > 0,
                "Row {key} exists with no references"
            );
            for (hash, count) in &row.ref_counts {
                anyhow::ensure!(
                    *count >= 0,
                    "Row {key} has negative refcount for {hash}"
                );
                anyhow::ensure!(
                    self.queries.contains_key(hash),
                    "Row {key} references unknown query {hash}"
                );
            }
        }
        for (client_id, client) in &self.clients {
            for hash in &client.desired_queries {
                anyhow::ensure!(
                    self.queries.contains_key(hash),
                    "Client {client_id} desires unknown query {hash}"
                );
            }
        }
        Ok(())
    }
}
