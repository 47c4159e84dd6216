use common::value::{
    RowKey,
    SqlValue,
};

use crate::{
    testing::{
        int,
        row,
        text,
        TestMutation,
        TestReplica,
    },
    AdvanceResult,
    ChangeOp,
    Snapshotter,
};

fn users_table(replica: &TestReplica) -> anyhow::Result<()> {
    replica.create_table(
        "users",
        &["id"],
        "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT, age INTEGER)",
    )
}

#[test]
fn test_current_reads_version() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    users_table(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);

    let snapshot = snapshotter.current()?;
    assert_eq!(snapshot.version().0, 0);
    drop(snapshot);

    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u1")]),
        row(vec![("id", text("u1")), ("name", text("Ann")), ("age", int(30))]),
    )])?;
    let snapshot = snapshotter.current()?;
    assert_eq!(snapshot.version().0, 1);
    Ok(())
}

#[test]
fn test_snapshot_isolation() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    users_table(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u1")]),
        row(vec![("id", text("u1")), ("name", text("Ann")), ("age", int(30))]),
    )])?;

    let snapshot = snapshotter.current()?;
    // A commit after the snapshot opened must not be visible through it.
    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u2")]),
        row(vec![("id", text("u2")), ("name", text("Bob")), ("age", int(41))]),
    )])?;

    let rows = snapshot.select("SELECT * FROM users ORDER BY id", &[])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&text("u1")));
    Ok(())
}

#[test]
fn test_get_row_and_row_key() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    users_table(&replica)?;
    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u1")]),
        row(vec![("id", text("u1")), ("name", text("Ann")), ("age", int(30))]),
    )])?;
    let snapshot = Snapshotter::new(&replica.path).current()?;

    let key = RowKey::new("users", vec![text("u1")]);
    let fetched = snapshot.get_row(&key)?.expect("row missing");
    assert_eq!(fetched.get("name"), Some(&text("Ann")));
    assert_eq!(snapshot.row_key("users", &fetched)?, key);

    let absent = snapshot.get_row(&RowKey::new("users", vec![text("nope")]))?;
    assert!(absent.is_none());
    Ok(())
}

#[test]
fn test_advance_same_version() -> anyhow::Result<()> {
    let replica = TestReplica::new()?;
    users_table(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let snapshot = snapshotter.current()?;
    assert!(matches!(
        snapshotter.advance(&snapshot)?,
        AdvanceResult::SameVersion
    ));
    Ok(())
}

#[test]
fn test_advance_yields_ordered_changes() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    users_table(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let snapshot = snapshotter.current()?;

    let u1 = RowKey::new("users", vec![text("u1")]);
    let initial = row(vec![("id", text("u1")), ("name", text("Ann")), ("age", int(30))]);
    let renamed = row(vec![("id", text("u1")), ("name", text("Anne")), ("age", int(30))]);
    replica.commit(vec![TestMutation::insert(u1.clone(), initial.clone())])?;
    replica.commit(vec![TestMutation::update(
        u1.clone(),
        initial.clone(),
        renamed.clone(),
    )])?;
    replica.commit(vec![TestMutation::delete(u1.clone(), renamed.clone())])?;

    let AdvanceResult::Advanced {
        snapshot: next,
        from_version,
        to_version,
        changes,
    } = snapshotter.advance(&snapshot)?
    else {
        panic!("expected advance");
    };
    assert_eq!(from_version.0, 0);
    assert_eq!(to_version.0, 3);
    assert_eq!(next.version().0, 3);
    assert_eq!(changes.total(), 3);

    let entries: Vec<_> = changes.collect::<anyhow::Result<_>>()?;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].op, ChangeOp::Insert);
    assert_eq!(entries[1].op, ChangeOp::Update);
    assert_eq!(entries[2].op, ChangeOp::Delete);
    assert_eq!(entries[1].prev_row.as_ref(), Some(&initial));
    assert_eq!(entries[1].new_row.as_ref(), Some(&renamed));
    assert_eq!(entries[2].new_row, None);
    for entry in &entries {
        assert_eq!(entry.key, u1);
    }
    Ok(())
}

#[test]
fn test_change_log_bounded_to_interval() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    users_table(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);

    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u1")]),
        row(vec![("id", text("u1")), ("name", text("Ann")), ("age", int(30))]),
    )])?;
    let mid = snapshotter.current()?;
    replica.commit(vec![TestMutation::insert(
        RowKey::new("users", vec![text("u2")]),
        row(vec![("id", text("u2")), ("name", text("Bob")), ("age", int(41))]),
    )])?;

    let AdvanceResult::Advanced { changes, .. } = snapshotter.advance(&mid)? else {
        panic!("expected advance");
    };
    let entries: Vec<_> = changes.collect::<anyhow::Result<_>>()?;
    // Only the commit after `mid` is in (from, to].
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key.pk, vec![text("u2")]);
    Ok(())
}

#[test]
fn test_missing_state_table_is_replica_unavailable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("empty.db");
    rusqlite::Connection::open(&path)?.execute_batch("CREATE TABLE unrelated (x)")?;
    let err = Snapshotter::new(&path).current().unwrap_err();
    assert!(err.downcast_ref::<crate::ReplicaUnavailable>().is_some());
    Ok(())
}

#[test]
fn test_bool_payloads_become_integers() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    replica.create_table(
        "flags",
        &["id"],
        "CREATE TABLE flags (id TEXT PRIMARY KEY, enabled INTEGER)",
    )?;
    let snapshotter = Snapshotter::new(&replica.path);
    let base = snapshotter.current()?;
    replica.commit(vec![TestMutation::insert(
        RowKey::new("flags", vec![text("f1")]),
        row(vec![("id", text("f1")), ("enabled", SqlValue::Integer(1))]),
    )])?;
    let AdvanceResult::Advanced { changes, .. } = snapshotter.advance(&base)? else {
        panic!("expected advance");
    };
    let entries: Vec<_> = changes.collect::<anyhow::Result<_>>()?;
    assert_eq!(
        entries[0].new_row.as_ref().unwrap().get("enabled"),
        Some(&SqlValue::Integer(1))
    );
    Ok(())
}
