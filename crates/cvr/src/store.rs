use std::{
    collections::BTreeMap,
    path::Path,
};

use anyhow::Context as _;
use common::types::{
    ClientGroupId,
    ClientId,
    CvrVersion,
    QueryHash,
    ReplicaVersion,
    TransformationHash,
};
use common::value::RowKey;
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension as _,
};
use serde::Serialize;
use sync_types::QuerySpec;

use crate::{
    model::{
        ClientRecord,
        Cvr,
        QueryRecord,
        RowRecord,
    },
    updater::{
        CvrOp,
        CvrUpdater,
    },
    CvrConflict,
};

const CVR_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS cvr_instances (
    client_group_id TEXT PRIMARY KEY,
    major INTEGER NOT NULL,
    minor INTEGER NOT NULL,
    client_schema TEXT
);
CREATE TABLE IF NOT EXISTS cvr_clients (
    client_group_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    lmid INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER,
    PRIMARY KEY (client_group_id, client_id)
);
CREATE TABLE IF NOT EXISTS cvr_desires (
    client_group_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    PRIMARY KEY (client_group_id, client_id, query_hash)
);
CREATE TABLE IF NOT EXISTS cvr_queries (
    client_group_id TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    spec TEXT NOT NULL,
    transformation_hash TEXT,
    gotten INTEGER NOT NULL DEFAULT 0,
    ttl_ms INTEGER,
    expires_at INTEGER,
    internal INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (client_group_id, query_hash)
);
CREATE TABLE IF NOT EXISTS cvr_rows (
    client_group_id TEXT NOT NULL,
    tbl TEXT NOT NULL,
    pk TEXT NOT NULL,
    row_version INTEGER NOT NULL,
    columns TEXT NOT NULL,
    ref_counts TEXT NOT NULL,
    PRIMARY KEY (client_group_id, tbl, pk)
);
"#;

/// Diagnostic join of one query's CVR state, returned by
/// [`CvrStore::inspect_queries`].
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InspectQueryRecord {
    pub query_hash: QueryHash,
    pub transformation_hash: Option<TransformationHash>,
    pub gotten: bool,
    pub ttl_ms: Option<u64>,
    pub expires_at: Option<u64>,
    pub row_count: u64,
}

/// Transactional persistence for CVRs. One connection behind a mutex; the
/// store accepts concurrent updaters for different client groups, and the
/// view syncer guarantees a single in-flight updater per group.
pub struct CvrStore {
    conn: Mutex<Connection>,
}

impl CvrStore {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open CVR store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(CVR_INIT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CVR_INIT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Begin an in-memory transaction over a loaded CVR.
    pub fn updater(cvr: &Cvr) -> CvrUpdater {
        CvrUpdater::new(cvr)
    }

    /// Load the frozen in-memory CVR for a client group. A group with no
    /// persisted state loads as a fresh CVR at the initial version.
    pub fn load(&self, client_group_id: &ClientGroupId) -> anyhow::Result<Cvr> {
        let conn = self.conn.lock();
        let group = client_group_id.as_str();
        let mut cvr = Cvr::new(client_group_id.clone());

        let instance: Option<(i64, i64, Option<String>)> = conn
            .query_row(
                "SELECT major, minor, client_schema FROM cvr_instances WHERE client_group_id = ?1",
                [group],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((major, minor, client_schema)) = instance else {
            return Ok(cvr);
        };
        cvr.version = CvrVersion {
            major: major as u64,
            minor: minor as u64,
        };
        cvr.client_schema = client_schema
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Invalid persisted client schema")?;

        let mut stmt = conn.prepare(
            "SELECT client_id, lmid, expires_at FROM cvr_clients WHERE client_group_id = ?1",
        )?;
        let mut rows = stmt.query([group])?;
        while let Some(row) = rows.next()? {
            let client_id: String = row.get(0)?;
            let lmid: i64 = row.get(1)?;
            let expires_at: Option<i64> = row.get(2)?;
            cvr.clients.insert(
                ClientId::from(client_id),
                ClientRecord {
                    desired_queries: Default::default(),
                    expires_at: expires_at.map(|v| v as u64),
                    lmid: lmid as u64,
                },
            );
        }
        drop(rows);
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT client_id, query_hash FROM cvr_desires WHERE client_group_id = ?1",
        )?;
        let mut rows = stmt.query([group])?;
        while let Some(row) = rows.next()? {
            let client_id: String = row.get(0)?;
            let hash: String = row.get(1)?;
            cvr.clients
                .entry(ClientId::from(client_id))
                .or_default()
                .desired_queries
                .insert(QueryHash::from(hash));
        }
        drop(rows);
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT query_hash, spec, transformation_hash, gotten, ttl_ms, expires_at, internal \
             FROM cvr_queries WHERE client_group_id = ?1",
        )?;
        let mut rows = stmt.query([group])?;
        while let Some(row) = rows.next()? {
            let hash: String = row.get(0)?;
            let spec_raw: String = row.get(1)?;
            let transformation_hash: Option<String> = row.get(2)?;
            let gotten: bool = row.get(3)?;
            let ttl_ms: Option<i64> = row.get(4)?;
            let expires_at: Option<i64> = row.get(5)?;
            let internal: i64 = row.get(6)?;
            let spec: QuerySpec =
                serde_json::from_str(&spec_raw).context("Invalid persisted query spec")?;
            cvr.queries.insert(
                QueryHash::from(hash),
                QueryRecord {
                    spec,
                    transformation_hash: transformation_hash.map(TransformationHash::from),
                    gotten,
                    ttl_ms: ttl_ms.map(|v| v as u64),
                    expires_at: expires_at.map(|v| v as u64),
                    internal_ref_count: internal as u32,
                },
            );
        }
        drop(rows);
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT tbl, pk, row_version, columns, ref_counts FROM cvr_rows \
             WHERE client_group_id = ?1",
        )?;
        let mut rows = stmt.query([group])?;
        while let Some(row) = rows.next()? {
            let table: String = row.get(0)?;
            let pk: String = row.get(1)?;
            let row_version: i64 = row.get(2)?;
            let columns_raw: String = row.get(3)?;
            let ref_counts_raw: String = row.get(4)?;
            let key = RowKey::pk_from_json(&table, &pk)?;
            let ref_counts: BTreeMap<QueryHash, i64> = serde_json::from_str(&ref_counts_raw)
                .context("Invalid persisted row refcounts")?;
            cvr.rows.insert(
                key,
                RowRecord {
                    ref_counts,
                    columns: serde_json::from_str(&columns_raw)
                        .context("Invalid persisted row columns")?,
                    row_version: ReplicaVersion(row_version as u64),
                },
            );
        }
        Ok(cvr)
    }

    /// Durably commit an updater in a single transaction keyed by
    /// `(client_group_id, prior_version -> new_version)`. Returns the new
    /// in-memory CVR on success; fails with [`CvrConflict`] when the
    /// persisted version no longer matches.
    pub fn flush(&self, updater: CvrUpdater) -> anyhow::Result<Cvr> {
        let CvrUpdater {
            prior_version,
            cvr,
            ops,
            touched_rows,
        } = updater;
        let group = cvr.client_group_id.as_str();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let persisted: Option<(i64, i64)> = tx
            .query_row(
                "SELECT major, minor FROM cvr_instances WHERE client_group_id = ?1",
                [group],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let persisted_version = persisted
            .map(|(major, minor)| CvrVersion {
                major: major as u64,
                minor: minor as u64,
            })
            .unwrap_or_else(CvrVersion::initial);
        if persisted_version != prior_version {
            return Err(CvrConflict {
                client_group_id: cvr.client_group_id.clone(),
                expected: prior_version,
                found: persisted_version,
            }
            .into());
        }

        for op in &ops {
            apply_op(&tx, group, op)?;
        }
        for key in &touched_rows {
            match cvr.rows.get(key) {
                Some(row) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO cvr_rows \
                         (client_group_id, tbl, pk, row_version, columns, ref_counts) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            group,
                            key.table,
                            key.pk_json(),
                            row.row_version.0 as i64,
                            serde_json::to_string(&row.columns)?,
                            serde_json::to_string(&row.ref_counts)?,
                        ],
                    )?;
                },
                None => {
                    tx.execute(
                        "DELETE FROM cvr_rows WHERE client_group_id = ?1 AND tbl = ?2 AND pk = ?3",
                        params![group, key.table, key.pk_json()],
                    )?;
                },
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO cvr_instances (client_group_id, major, minor, client_schema) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group,
                cvr.version.major as i64,
                cvr.version.minor as i64,
                cvr.client_schema
                    .as_ref()
                    .map(|s| serde_json::to_string(s))
                    .transpose()?,
            ],
        )?;
        tx.commit()?;
        Ok(cvr)
    }

    /// Diagnostic read of per-query rows joined with TTL state, optionally
    /// restricted to one client's desired set.
    pub fn inspect_queries(
        &self,
        client_group_id: &ClientGroupId,
        client_id: Option<&ClientId>,
    ) -> anyhow::Result<Vec<InspectQueryRecord>> {
        let cvr = self.load(client_group_id)?;
        let filter: Option<&ClientRecord> = match client_id {
            Some(id) => Some(
                cvr.clients
                    .get(id)
                    .with_context(|| format!("Unknown client {id}"))?,
            ),
            None => None,
        };
        let mut out = Vec::new();
        for (hash, query) in &cvr.queries {
            if let Some(client) = filter {
                if !client.desired_queries.contains(hash) {
                    continue;
                }
            }
            let row_count = cvr
                .rows
                .values()
                .filter(|row| row.ref_counts.get(hash).copied().unwrap_or(0) > 0)
                .count() as u64;
            out.push(InspectQueryRecord {
                query_hash: hash.clone(),
                transformation_hash: query.transformation_hash.clone(),
                gotten: query.gotten,
                ttl_ms: query.ttl_ms,
                expires_at: query.expires_at,
                row_count,
            });
        }
        Ok(out)
    }
}

fn apply_op(tx: &rusqlite::Transaction<'_>, group: &str, op: &CvrOp) -> anyhow::Result<()> {
    match op {
        CvrOp::EnsureClient { client_id } => {
            tx.execute(
                "INSERT OR IGNORE INTO cvr_clients (client_group_id, client_id) VALUES (?1, ?2)",
                params![group, client_id.as_str()],
            )?;
        },
        CvrOp::SetClientExpiry {
            client_id,
            expires_at,
        } => {
            tx.execute(
                "UPDATE cvr_clients SET expires_at = ?3 \
                 WHERE client_group_id = ?1 AND client_id = ?2",
                params![group, client_id.as_str(), expires_at.map(|v| v as i64)],
            )?;
        },
        CvrOp::SetLmid { client_id, lmid } => {
            tx.execute(
                "UPDATE cvr_clients SET lmid = ?3 \
                 WHERE client_group_id = ?1 AND client_id = ?2",
                params![group, client_id.as_str(), *lmid as i64],
            )?;
        },
        CvrOp::PutDesire { client_id, hash } => {
            tx.execute(
                "INSERT OR IGNORE INTO cvr_desires (client_group_id, client_id, query_hash) \
                 VALUES (?1, ?2, ?3)",
                params![group, client_id.as_str(), hash.as_str()],
            )?;
        },
        CvrOp::DelDesire { client_id, hash } => {
            tx.execute(
                "DELETE FROM cvr_desires WHERE client_group_id = ?1 AND client_id = ?2 \
                 AND query_hash = ?3",
                params![group, client_id.as_str(), hash.as_str()],
            )?;
        },
        CvrOp::PutQuery { hash, spec, ttl_ms } => {
            tx.execute(
                "INSERT OR REPLACE INTO cvr_queries \
                 (client_group_id, query_hash, spec, ttl_ms) VALUES (?1, ?2, ?3, ?4)",
                params![
                    group,
                    hash.as_str(),
                    serde_json::to_string(spec)?,
                    ttl_ms.map(|v| v as i64),
                ],
            )?;
        },
        CvrOp::SetTransformation {
            hash,
            transformation_hash,
        } => {
            tx.execute(
                "UPDATE cvr_queries SET transformation_hash = ?3 \
                 WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str(), transformation_hash.as_str()],
            )?;
        },
        CvrOp::MarkGotten { hash } => {
            tx.execute(
                "UPDATE cvr_queries SET gotten = 1 \
                 WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str()],
            )?;
        },
        CvrOp::ClearQueryState { hash } => {
            tx.execute(
                "UPDATE cvr_queries SET transformation_hash = NULL, gotten = 0 \
                 WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str()],
            )?;
        },
        CvrOp::SetQueryExpiry { hash, expires_at } => {
            tx.execute(
                "UPDATE cvr_queries SET expires_at = ?3 \
                 WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str(), expires_at.map(|v| v as i64)],
            )?;
        },
        CvrOp::RemoveQuery { hash } => {
            tx.execute(
                "DELETE FROM cvr_queries WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str()],
            )?;
            tx.execute(
                "DELETE FROM cvr_desires WHERE client_group_id = ?1 AND query_hash = ?2",
                params![group, hash.as_str()],
            )?;
        },
        CvrOp::RemoveClient { client_id } => {
            tx.execute(
                "DELETE FROM cvr_clients WHERE client_group_id = ?1 AND client_id = ?2",
                params![group, client_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM cvr_desires WHERE client_group_id = ?1 AND client_id = ?2",
                params![group, client_id.as_str()],
            )?;
        },
        CvrOp::SetClientSchema { schema } => {
            tx.execute(
                "UPDATE cvr_instances SET client_schema = ?2 WHERE client_group_id = ?1",
                params![group, serde_json::to_string(schema)?],
            )?;
        },
    }
    Ok(())
}
