use std::time::Duration;

use common::{
    query::{
        cmp,
        column,
        literal,
        Ast,
        CmpOp,
        Correlation,
        Direction,
        OrderPart,
        RelatedQuery,
    },
    types::{
        QueryHash,
        TransformationHash,
    },
    value::{
        RowData,
        RowKey,
        SqlValue,
    },
};
use pretty_assertions::assert_eq;
use replica::{
    testing::{
        int,
        row,
        text,
        TestMutation,
        TestReplica,
    },
    AdvanceResult,
    Snapshotter,
};

use crate::{
    PipelineDriver,
    ResetPipelinesSignal,
    RowChange,
    ScriptedTimer,
    SnapshotStale,
    WallClockTimer,
};

fn setup_issue_tracker(replica: &TestReplica) -> anyhow::Result<()> {
    replica.create_table(
        "users",
        &["id"],
        "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT)",
    )?;
    replica.create_table(
        "issues",
        &["id"],
        "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, open INTEGER, \
         modified INTEGER, creatorID TEXT)",
    )?;
    Ok(())
}

fn user_row(id: &str, name: &str) -> RowData {
    row(vec![("id", text(id)), ("name", text(name))])
}

fn issue_row(id: &str, title: &str, open: i64, modified: i64, creator: &str) -> RowData {
    row(vec![
        ("id", text(id)),
        ("title", text(title)),
        ("open", int(open)),
        ("modified", int(modified)),
        ("creatorID", text(creator)),
    ])
}

fn user_key(id: &str) -> RowKey {
    RowKey::new("users", vec![text(id)])
}

fn issue_key(id: &str) -> RowKey {
    RowKey::new("issues", vec![text(id)])
}

fn issues_with_creator() -> Ast {
    let mut ast = Ast::table("issues");
    ast.order_by = vec![OrderPart {
        column: "modified".into(),
        dir: Direction::Asc,
    }];
    ast.related = vec![RelatedQuery {
        correlation: Correlation {
            parent_fields: vec!["creatorID".into()],
            child_fields: vec!["id".into()],
        },
        alias: "creator".into(),
        sub_query: Ast::table("users"),
    }];
    ast
}

fn open_issues_limited(limit: u64) -> Ast {
    let mut ast = Ast::table("issues");
    ast.where_clause = Some(cmp(
        column("open"),
        CmpOp::Eq,
        literal(SqlValue::Integer(1)),
    ));
    ast.order_by = vec![OrderPart {
        column: "modified".into(),
        dir: Direction::Asc,
    }];
    ast.limit = Some(limit);
    ast
}

fn th(ast: &Ast) -> TransformationHash {
    ast.transformation_hash()
}

fn qh(name: &str) -> QueryHash {
    QueryHash::from(name)
}

fn drain(
    advancement: &mut crate::Advancement<'_>,
) -> anyhow::Result<Vec<crate::PipelineChange>> {
    advancement.collect()
}

#[test]
fn test_hydration_interleaves_related_rows() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    replica.commit(vec![
        TestMutation::insert(user_key("u1"), user_row("u1", "Ann")),
        TestMutation::insert(user_key("u2"), user_row("u2", "Bob")),
        TestMutation::insert(issue_key("i1"), issue_row("i1", "first", 1, 1, "u1")),
        TestMutation::insert(issue_key("i2"), issue_row("i2", "second", 1, 2, "u2")),
    ])?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = issues_with_creator();
    let changes = driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;
    let keys: Vec<RowKey> = changes.iter().map(|c| c.key().clone()).collect();
    // Primary rows in orderBy order, each followed depth-first by its
    // related child rows.
    assert_eq!(
        keys,
        vec![issue_key("i1"), user_key("u1"), issue_key("i2"), user_key("u2")]
    );
    assert!(changes
        .iter()
        .all(|c| matches!(c, RowChange::Add { .. })));
    Ok(())
}

#[test]
fn test_shared_transformation_hydrates_once() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    replica.commit(vec![TestMutation::insert(
        issue_key("i1"),
        issue_row("i1", "first", 1, 1, "u1"),
    )])?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = open_issues_limited(10);
    let first = driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;
    assert_eq!(first.len(), 1);
    // Distinct query hash, identical transformation: no second hydration.
    let second = driver.add_query(&th(&ast), &qh("q2"), &ast, &WallClockTimer::new())?;
    assert!(second.is_empty());
    let mut ids = driver.query_ids(&th(&ast));
    ids.sort();
    assert_eq!(ids, vec![qh("q1"), qh("q2")]);
    Ok(())
}

#[test]
fn test_advance_membership_transitions() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = open_issues_limited(10);
    driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;

    // Insert a matching row.
    let open = issue_row("i1", "first", 1, 1, "u1");
    replica.commit(vec![TestMutation::insert(issue_key("i1"), open.clone())])?;
    let prev = driver.snapshot().unwrap();
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(prev)?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    assert_eq!(emitted.len(), 1);
    assert!(
        matches!(&emitted[0].change, RowChange::Add { key, .. } if *key == issue_key("i1"))
    );

    // Close it: the filter no longer matches and the row leaves the view.
    let closed = issue_row("i1", "first", 0, 2, "u1");
    replica.commit(vec![TestMutation::update(
        issue_key("i1"),
        open,
        closed.clone(),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    assert_eq!(emitted.len(), 1);
    assert!(
        matches!(&emitted[0].change, RowChange::Remove { key } if *key == issue_key("i1"))
    );

    // Deleting an already-invisible row emits nothing.
    replica.commit(vec![TestMutation::delete(issue_key("i1"), closed)])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    assert!(emitted.is_empty());
    Ok(())
}

#[test]
fn test_limited_window_evicts_and_refills() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    replica.commit(vec![
        TestMutation::insert(issue_key("i1"), issue_row("i1", "a", 1, 1, "u1")),
        TestMutation::insert(issue_key("i2"), issue_row("i2", "b", 1, 2, "u1")),
        TestMutation::insert(issue_key("i3"), issue_row("i3", "c", 1, 3, "u1")),
    ])?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = open_issues_limited(2);
    let hydrated = driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;
    let keys: Vec<RowKey> = hydrated.iter().map(|c| c.key().clone()).collect();
    assert_eq!(keys, vec![issue_key("i1"), issue_key("i2")]);

    // A row ahead of the window evicts the tail.
    replica.commit(vec![TestMutation::insert(
        issue_key("i0"),
        issue_row("i0", "z", 1, 0, "u1"),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    let adds: Vec<&RowKey> = emitted
        .iter()
        .filter_map(|c| match &c.change {
            RowChange::Add { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    let removes: Vec<&RowKey> = emitted
        .iter()
        .filter_map(|c| match &c.change {
            RowChange::Remove { key } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(adds, vec![&issue_key("i0")]);
    assert_eq!(removes, vec![&issue_key("i2")]);

    // Removing a window row pulls the next one back in.
    replica.commit(vec![TestMutation::delete(
        issue_key("i0"),
        issue_row("i0", "z", 1, 0, "u1"),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    let adds: Vec<&RowKey> = emitted
        .iter()
        .filter_map(|c| match &c.change {
            RowChange::Add { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    let removes: Vec<&RowKey> = emitted
        .iter()
        .filter_map(|c| match &c.change {
            RowChange::Remove { key } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(removes, vec![&issue_key("i0")]);
    assert_eq!(adds, vec![&issue_key("i2")]);
    Ok(())
}

#[test]
fn test_child_update_fans_out_to_parents() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    let ann = user_row("u1", "Ann");
    replica.commit(vec![
        TestMutation::insert(user_key("u1"), ann.clone()),
        TestMutation::insert(issue_key("i1"), issue_row("i1", "a", 1, 1, "u1")),
        TestMutation::insert(issue_key("i2"), issue_row("i2", "b", 1, 2, "u1")),
    ])?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = issues_with_creator();
    driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;

    // One user update touches the creator window under both issues.
    replica.commit(vec![TestMutation::update(
        user_key("u1"),
        ann,
        user_row("u1", "Anne"),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    drop(advancement);
    let updates: Vec<&RowKey> = emitted
        .iter()
        .filter_map(|c| match &c.change {
            RowChange::Update { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![&user_key("u1"), &user_key("u1")]);
    Ok(())
}

#[test]
fn test_runaway_advancement_raises_reset_signal() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    let ann = user_row("u1", "Ann");
    let mut mutations = vec![TestMutation::insert(user_key("u1"), ann.clone())];
    for i in 0..1000 {
        let id = format!("i{i}");
        mutations.push(TestMutation::insert(
            RowKey::new("issues", vec![text(&id)]),
            issue_row(&id, "spam", 1, i, "u1"),
        ));
    }
    replica.commit(mutations)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    // Hydration observed at 1000ms: the scripted timer reads 0 at hydration
    // start and 1000 at completion.
    let hydration_timer = ScriptedTimer::new([Duration::ZERO, Duration::from_millis(1000)]);
    let ast = issues_with_creator();
    let hydrated = driver.add_query(&th(&ast), &qh("q1"), &ast, &hydration_timer)?;
    assert_eq!(hydrated.len(), 2000);
    assert_eq!(driver.total_hydration_time(), Duration::from_millis(1000));

    // One user update that would fan out to 1000 issues, but the clock has
    // already blown the 500ms budget.
    replica.commit(vec![TestMutation::update(
        user_key("u1"),
        ann,
        user_row("u1", "Anne"),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = ScriptedTimer::constant(Duration::from_millis(501));
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let err = advancement
        .next()
        .expect("expected an item")
        .expect_err("expected reset signal before any output");
    let signal = err
        .downcast_ref::<ResetPipelinesSignal>()
        .expect("expected ResetPipelinesSignal");
    assert_eq!(
        signal.message,
        "Advancement exceeded timeout at 0 of 1 changes after 501 ms. Advancement time \
         limited base on total hydration time of 1000 ms."
    );
    assert!(advancement.next().is_none());
    drop(advancement);

    // The driver is poisoned until reset; afterwards queries rebuild
    // against a fresh snapshot.
    assert!(driver.is_poisoned());
    driver.reset("advancement exceeded budget");
    assert!(!driver.is_poisoned());
    assert!(driver.transformations().is_empty());
    driver.init(snapshotter.current()?)?;
    let rehydrated = driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;
    assert_eq!(rehydrated.len(), 2000);
    Ok(())
}

#[test]
fn test_stale_snapshot_rejected() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    replica.commit(vec![TestMutation::insert(
        issue_key("i1"),
        issue_row("i1", "a", 1, 1, "u1"),
    )])?;
    let mid = snapshotter.current()?;
    replica.commit(vec![TestMutation::insert(
        issue_key("i2"),
        issue_row("i2", "b", 1, 2, "u1"),
    )])?;

    // Changes starting at version 1 do not apply to a driver at version 0.
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(&mid)?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let err = driver
        .advance(snapshot, from_version, changes, &timer)
        .unwrap_err();
    assert!(err.downcast_ref::<SnapshotStale>().is_some());
    Ok(())
}

#[test]
fn test_dropped_advancement_poisons_driver() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;
    let ast = open_issues_limited(10);
    driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;

    replica.commit(vec![TestMutation::insert(
        issue_key("i1"),
        issue_row("i1", "a", 1, 1, "u1"),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    // Discard without draining.
    drop(advancement);
    assert!(driver.is_poisoned());
    Ok(())
}

#[test]
fn test_lmid_table_entries_are_intercepted() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    replica.create_table(
        "_sync_clients",
        &["clientGroupID", "clientID"],
        "CREATE TABLE \"_sync_clients\" (clientGroupID TEXT, clientID TEXT, \
         lastMutationID INTEGER, PRIMARY KEY (clientGroupID, clientID))",
    )?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;
    let ast = open_issues_limited(10);
    driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;

    replica.commit(vec![TestMutation::insert(
        RowKey::new("_sync_clients", vec![text("g1"), text("c1")]),
        row(vec![
            ("clientGroupID", text("g1")),
            ("clientID", text("c1")),
            ("lastMutationID", int(5)),
        ]),
    )])?;
    let AdvanceResult::Advanced {
        snapshot,
        from_version,
        changes,
        ..
    } = snapshotter.advance(driver.snapshot().unwrap())?
    else {
        panic!("expected advance");
    };
    let timer = WallClockTimer::new();
    let mut advancement = driver.advance(snapshot, from_version, changes, &timer)?;
    let emitted = drain(&mut advancement)?;
    assert!(emitted.is_empty());
    let lmid_entries = advancement.into_lmid_entries();
    assert_eq!(lmid_entries.len(), 1);
    assert_eq!(
        lmid_entries[0].new_row.as_ref().unwrap().get("lastMutationID"),
        Some(&int(5))
    );
    Ok(())
}

#[test]
fn test_remove_query_tears_down_on_last_reference() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    setup_issue_tracker(&replica)?;
    replica.commit(vec![TestMutation::insert(
        issue_key("i1"),
        issue_row("i1", "a", 1, 1, "u1"),
    )])?;
    let snapshotter = Snapshotter::new(&replica.path);
    let mut driver = PipelineDriver::new();
    driver.init(snapshotter.current()?)?;

    let ast = open_issues_limited(10);
    driver.add_query(&th(&ast), &qh("q1"), &ast, &WallClockTimer::new())?;
    driver.add_query(&th(&ast), &qh("q2"), &ast, &WallClockTimer::new())?;

    assert_eq!(driver.remove_query(&qh("q1")), None);
    assert!(driver.has_pipeline(&th(&ast)));
    assert_eq!(driver.remove_query(&qh("q2")), Some(th(&ast)));
    assert!(!driver.has_pipeline(&th(&ast)));
    assert_eq!(driver.total_hydration_time(), Duration::ZERO);
    Ok(())
}
