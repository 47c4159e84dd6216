//! Helpers for building throwaway replica files in tests.

use std::path::PathBuf;

use common::value::{
    RowData,
    RowKey,
    SqlValue,
};
use rusqlite::Connection;

use crate::{
    snapshot::sql_value_to_sqlite,
    ChangeOp,
};

const REPLICA_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS replication_state (
    lock INTEGER PRIMARY KEY CHECK (lock = 1),
    max_version INTEGER NOT NULL
);
INSERT OR IGNORE INTO replication_state (lock, max_version) VALUES (1, 0);
CREATE TABLE IF NOT EXISTS change_log (
    version INTEGER NOT NULL,
    tbl TEXT NOT NULL,
    pk TEXT NOT NULL,
    op TEXT NOT NULL,
    prev_row TEXT,
    new_row TEXT
);
CREATE INDEX IF NOT EXISTS change_log_version ON change_log (version);
CREATE TABLE IF NOT EXISTS table_meta (
    tbl TEXT PRIMARY KEY,
    pk_cols TEXT NOT NULL
);
"#;

/// One application of a write to the replica, mirroring what the
/// replication ingest produces.
#[derive(Clone, Debug)]
pub struct TestMutation {
    pub key: RowKey,
    pub op: ChangeOp,
    pub prev_row: Option<RowData>,
    pub new_row: Option<RowData>,
}

impl TestMutation {
    pub fn insert(key: RowKey, row: RowData) -> Self {
        Self {
            key,
            op: ChangeOp::Insert,
            prev_row: None,
            new_row: Some(row),
        }
    }

    pub fn update(key: RowKey, prev: RowData, row: RowData) -> Self {
        Self {
            key,
            op: ChangeOp::Update,
            prev_row: Some(prev),
            new_row: Some(row),
        }
    }

    pub fn delete(key: RowKey, prev: RowData) -> Self {
        Self {
            key,
            op: ChangeOp::Delete,
            prev_row: Some(prev),
            new_row: None,
        }
    }
}

pub struct TestReplica {
    pub path: PathBuf,
    conn: Connection,
    _dir: tempfile::TempDir,
}

impl TestReplica {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("replica.db");
        let conn = Connection::open(&path)?;
        // WAL keeps open snapshots from blocking test writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(REPLICA_INIT)?;
        Ok(Self {
            path,
            conn,
            _dir: dir,
        })
    }

    /// Create an application table and record its primary key metadata.
    pub fn create_table(&self, name: &str, pk_cols: &[&str], sql: &str) -> anyhow::Result<()> {
        self.conn.execute_batch(sql)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO table_meta (tbl, pk_cols) VALUES (?1, ?2)",
            rusqlite::params![name, serde_json::to_string(pk_cols)?],
        )?;
        Ok(())
    }

    /// Apply a batch of mutations as one replicated commit: writes the
    /// tables, appends the change log, bumps the version. Returns the new
    /// max version.
    pub fn commit(&mut self, mutations: Vec<TestMutation>) -> anyhow::Result<u64> {
        let tx = self.conn.transaction()?;
        let version: i64 =
            tx.query_row("SELECT max_version FROM replication_state", [], |row| {
                row.get(0)
            })?;
        let version = version + 1;
        for m in &mutations {
            apply_to_table(&tx, m)?;
            tx.execute(
                "INSERT INTO change_log (version, tbl, pk, op, prev_row, new_row) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    version,
                    m.key.table,
                    m.key.pk_json(),
                    m.op.as_str(),
                    m.prev_row.as_ref().map(row_json).transpose()?,
                    m.new_row.as_ref().map(row_json).transpose()?,
                ],
            )?;
        }
        tx.execute(
            "UPDATE replication_state SET max_version = ?1",
            [version],
        )?;
        tx.commit()?;
        Ok(version as u64)
    }
}

fn row_json(row: &RowData) -> anyhow::Result<String> {
    let object: serde_json::Map<String, serde_json::Value> = row
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    Ok(serde_json::Value::Object(object).to_string())
}

fn apply_to_table(tx: &rusqlite::Transaction<'_>, m: &TestMutation) -> anyhow::Result<()> {
    let pk_cols: Vec<String> = {
        let raw: String = tx.query_row(
            "SELECT pk_cols FROM table_meta WHERE tbl = ?1",
            [&m.key.table],
            |row| row.get(0),
        )?;
        serde_json::from_str(&raw)?
    };
    match (&m.op, &m.new_row) {
        (ChangeOp::Insert | ChangeOp::Update, Some(row)) => {
            let columns: Vec<&String> = row.keys().collect();
            let column_list = columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=columns.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT OR REPLACE INTO \"{}\" ({column_list}) VALUES ({placeholders})",
                m.key.table
            );
            let params: Vec<rusqlite::types::Value> =
                row.values().map(sql_value_to_sqlite).collect();
            tx.execute(&sql, rusqlite::params_from_iter(params))?;
        },
        (ChangeOp::Delete, _) => {
            let predicate = pk_cols
                .iter()
                .enumerate()
                .map(|(i, col)| format!("\"{col}\" = ?{}", i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!("DELETE FROM \"{}\" WHERE {predicate}", m.key.table);
            let params: Vec<rusqlite::types::Value> =
                m.key.pk.iter().map(sql_value_to_sqlite).collect();
            tx.execute(&sql, rusqlite::params_from_iter(params))?;
        },
        (op, None) => anyhow::bail!("Mutation {op:?} missing row payload"),
    }
    Ok(())
}

/// Row literal helper: `row!{"id" => SqlValue::Text("i1".into())}` without
/// pulling a macro in; plain function form.
pub fn row(pairs: Vec<(&str, SqlValue)>) -> RowData {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

pub fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_owned())
}

pub fn int(i: i64) -> SqlValue {
    SqlValue::Integer(i)
}
