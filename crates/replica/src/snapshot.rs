use std::{
    collections::BTreeMap,
    path::Path,
};

use anyhow::Context as _;
use common::{
    types::ReplicaVersion,
    value::{
        RowData,
        RowKey,
        SqlValue,
    },
};
use parking_lot::Mutex;
use rusqlite::{
    types::{
        Value as SqliteValue,
        ValueRef,
    },
    Connection,
    OpenFlags,
};

pub fn sql_value_from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

pub fn sql_value_to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(i) => SqliteValue::Integer(*i),
        SqlValue::Real(r) => SqliteValue::Real(*r),
        SqlValue::Text(t) => SqliteValue::Text(t.clone()),
        SqlValue::Blob(b) => SqliteValue::Blob(b.clone()),
    }
}

/// A read-only transaction against the replica pinned at one version. Two
/// snapshots opened at the same version are equivalent.
pub struct Snapshot {
    // Sqlite connections are not Sync; the coordinator owns the snapshot but
    // the inspector may probe it from a blocking task.
    conn: Mutex<Connection>,
    version: ReplicaVersion,
    pk_columns: Mutex<BTreeMap<String, Vec<String>>>,
}

impl Snapshot {
    pub(crate) fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open replica at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // Starting the transaction and touching the version table pins the
        // read snapshot.
        conn.execute_batch("BEGIN")?;
        let version: i64 = conn
            .query_row("SELECT max_version FROM replication_state", [], |row| {
                row.get(0)
            })
            .context("Failed to read replication state")?;
        anyhow::ensure!(version >= 0, "Negative replica version {version}");
        Ok(Self {
            conn: Mutex::new(conn),
            version: ReplicaVersion(version as u64),
            pk_columns: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn version(&self) -> ReplicaVersion {
        self.version
    }

    /// Primary key column names for a table, from the replicated metadata
    /// table. Cached for the snapshot's lifetime.
    pub fn pk_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        if let Some(cols) = self.pk_columns.lock().get(table) {
            return Ok(cols.clone());
        }
        let conn = self.conn.lock();
        let raw: String = conn
            .query_row(
                "SELECT pk_cols FROM table_meta WHERE tbl = ?1",
                [table],
                |row| row.get(0),
            )
            .with_context(|| format!("No primary key metadata for table {table}"))?;
        drop(conn);
        let cols: Vec<String> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid pk metadata for table {table}"))?;
        self.pk_columns
            .lock()
            .insert(table.to_owned(), cols.clone());
        Ok(cols)
    }

    /// Run an arbitrary read against the snapshot, returning every row as a
    /// column-name map.
    pub fn select(&self, sql: &str, params: &[SqlValue]) -> anyhow::Result<Vec<RowData>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare {sql}"))?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();
        let sqlite_params: Vec<SqliteValue> = params.iter().map(sql_value_to_sqlite).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(sqlite_params))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut data = RowData::new();
            for (i, name) in column_names.iter().enumerate() {
                data.insert(name.clone(), sql_value_from_sqlite(row.get_ref(i)?));
            }
            out.push(data);
        }
        Ok(out)
    }

    /// Fetch one row by primary key, or `None` if absent at this snapshot.
    pub fn get_row(&self, key: &RowKey) -> anyhow::Result<Option<RowData>> {
        let pk_cols = self.pk_columns(&key.table)?;
        anyhow::ensure!(
            pk_cols.len() == key.pk.len(),
            "Primary key arity mismatch for {}: {} != {}",
            key.table,
            pk_cols.len(),
            key.pk.len()
        );
        let predicate = pk_cols
            .iter()
            .enumerate()
            .map(|(i, col)| format!("\"{col}\" = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT * FROM \"{}\" WHERE {predicate}", key.table);
        let mut rows = self.select(&sql, &key.pk)?;
        anyhow::ensure!(rows.len() <= 1, "Duplicate primary key {key}");
        Ok(rows.pop())
    }

    /// Extract a row's key given the table's primary key metadata.
    pub fn row_key(&self, table: &str, row: &RowData) -> anyhow::Result<RowKey> {
        let pk_cols = self.pk_columns(table)?;
        let mut pk = Vec::with_capacity(pk_cols.len());
        for col in &pk_cols {
            let value = row
                .get(col)
                .with_context(|| format!("Row in {table} missing pk column {col}"))?;
            pk.push(value.clone());
        }
        Ok(RowKey::new(table, pk))
    }

    /// Release pinned pages. Dropping the snapshot has the same effect
    /// (closing the connection ends its read transaction); this form
    /// surfaces errors.
    pub fn close(self) -> anyhow::Result<()> {
        let conn = self.conn.into_inner();
        conn.execute_batch("ROLLBACK")?;
        conn.close()
            .map_err(|(_, e)| anyhow::anyhow!("Failed to close snapshot: {e}"))?;
        Ok(())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .finish()
    }
}
