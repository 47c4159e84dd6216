use std::{
    collections::VecDeque,
    path::Path,
};

use anyhow::Context as _;
use common::{
    knobs::CHANGE_LOG_CHUNK_SIZE,
    types::ReplicaVersion,
    value::{
        RowData,
        RowKey,
        SqlValue,
    },
};
use rusqlite::{
    Connection,
    OpenFlags,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "insert" => Ok(ChangeOp::Insert),
            "update" => Ok(ChangeOp::Update),
            "delete" => Ok(ChangeOp::Delete),
            other => anyhow::bail!("Unknown change op {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeLogEntry {
    pub version: ReplicaVersion,
    pub key: RowKey,
    pub op: ChangeOp,
    pub prev_row: Option<RowData>,
    pub new_row: Option<RowData>,
}

/// Ordered, finite, non-restartable lazy reader over the change log rows in
/// `(from, to]`. Rows at or below the target version are immutable, so the
/// reader owns its own read-only connection rather than borrowing the
/// snapshot's, and fetches in rowid-paginated chunks.
pub struct ChangeLog {
    conn: Connection,
    from: ReplicaVersion,
    to: ReplicaVersion,
    total: usize,
    last_rowid: i64,
    buffer: VecDeque<ChangeLogEntry>,
    exhausted: bool,
}

impl ChangeLog {
    pub(crate) fn open(
        path: &Path,
        from: ReplicaVersion,
        to: ReplicaVersion,
    ) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open change log reader")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_log WHERE version > ?1 AND version <= ?2",
            [from.0 as i64, to.0 as i64],
            |row| row.get(0),
        )?;
        Ok(Self {
            conn,
            from,
            to,
            total: total as usize,
            last_rowid: -1,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Total number of entries this reader will yield, known up front.
    pub fn total(&self) -> usize {
        self.total
    }

    fn fill_buffer(&mut self) -> anyhow::Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT rowid, version, tbl, pk, op, prev_row, new_row FROM change_log \
             WHERE version > ?1 AND version <= ?2 AND rowid > ?3 \
             ORDER BY rowid LIMIT ?4",
        )?;
        let mut rows = stmt.query(rusqlite::params![
            self.from.0 as i64,
            self.to.0 as i64,
            self.last_rowid,
            *CHANGE_LOG_CHUNK_SIZE as i64,
        ])?;
        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let version: i64 = row.get(1)?;
            let table: String = row.get(2)?;
            let pk_json: String = row.get(3)?;
            let op: String = row.get(4)?;
            let prev_row: Option<String> = row.get(5)?;
            let new_row: Option<String> = row.get(6)?;
            self.last_rowid = rowid;
            self.buffer.push_back(ChangeLogEntry {
                version: ReplicaVersion(version as u64),
                key: RowKey::pk_from_json(&table, &pk_json)?,
                op: ChangeOp::parse(&op)?,
                prev_row: prev_row.as_deref().map(parse_row).transpose()?,
                new_row: new_row.as_deref().map(parse_row).transpose()?,
            });
            fetched += 1;
        }
        if fetched < *CHANGE_LOG_CHUNK_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

fn parse_row(json: &str) -> anyhow::Result<RowData> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(json).context("Invalid change log row payload")?;
    Ok(object
        .into_iter()
        .map(|(k, v)| (k, SqlValue::from_json(v)))
        .collect())
}

impl Iterator for ChangeLog {
    type Item = anyhow::Result<ChangeLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill_buffer() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("total", &self.total)
            .finish()
    }
}
