use std::sync::Arc;

use common::{
    query::Ast,
    types::{
        ClientGroupId,
        ClientId,
        MutationId,
        QueryHash,
    },
    value::RowKey,
};
use cvr::CvrStore;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use query_metrics::QueryMetric;
use replica::testing::{
    int,
    row,
    text,
    TestMutation,
    TestReplica,
};
use sync_types::{
    ConnectParams,
    DesiredQueryPatchOp,
    InitConnectionBody,
    InspectDown,
    InspectUp,
    MutationErrorKind,
    MutationResponse,
    MutationResult,
    QuerySpec,
    RowPatchOp,
    ServerMessage,
};
use tokio::sync::watch;
use transform::{
    Permissions,
    Transformer,
};

use crate::{
    client::ClientReceiver,
    syncer::{
        ViewSyncer,
        ViewSyncerConfig,
    },
};

struct Harness {
    replica: TestReplica,
    syncer: ViewSyncer,
    _version_tx: watch::Sender<u64>,
}

impl Harness {
    fn new(group: &str) -> anyhow::Result<Self> {
        let replica = TestReplica::new()?;
        replica.create_table(
            "users",
            &["id"],
            "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT)",
        )?;
        replica.create_table(
            "issues",
            &["id"],
            "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, open INTEGER, \
             creatorID TEXT)",
        )?;
        replica.create_table(
            "_sync_clients",
            &["clientGroupID", "clientID"],
            "CREATE TABLE \"_sync_clients\" (clientGroupID TEXT, clientID TEXT, \
             lastMutationID INTEGER, PRIMARY KEY (clientGroupID, clientID))",
        )?;
        let store = Arc::new(CvrStore::in_memory()?);
        let transformer = Arc::new(Transformer::new(Arc::new(Permissions::empty())));
        let (version_tx, version_rx) = watch::channel(0);
        let config = ViewSyncerConfig {
            replica_path: replica.path.clone(),
            build_version: "test-build".into(),
            dev_mode: false,
        };
        let (mut syncer, _handle) = ViewSyncer::new(
            ClientGroupId::from(group),
            config,
            store,
            transformer,
            version_rx,
            None,
        );
        syncer.initialize()?;
        Ok(Self {
            replica,
            syncer,
            _version_tx: version_tx,
        })
    }

    async fn connect(&mut self, client_id: &str) -> anyhow::Result<ClientReceiver> {
        self.connect_with_init(client_id, InitConnectionBody::default())
            .await
    }

    async fn connect_with_init(
        &mut self,
        client_id: &str,
        init: InitConnectionBody,
    ) -> anyhow::Result<ClientReceiver> {
        let params = ConnectParams {
            client_id: ClientId::from(client_id),
            client_group_id: self.syncer.client_group_id().clone(),
            user_id: None,
            base_cookie: None,
            ts: None,
            lmid: 0,
            ws_id: None,
            debug_perf: false,
        };
        self.syncer.init_connection(params, init, None).await
    }

    async fn desire(
        &mut self,
        client_id: &str,
        hash: &str,
        ast: Ast,
    ) -> anyhow::Result<()> {
        let patch = vec![DesiredQueryPatchOp::Put {
            hash: hash.into(),
            query: QuerySpec::Ast { ast },
            ttl_ms: Some(60_000),
        }];
        self.syncer
            .change_desired_queries(&ClientId::from(client_id), &patch)
            .await
    }
}

fn drain(receiver: &mut ClientReceiver) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(message) = receiver.messages.try_recv() {
        out.push(message);
    }
    out
}

fn pokes_of(messages: &[ServerMessage]) -> Vec<&ServerMessage> {
    messages.iter().filter(|m| m.is_poke()).collect()
}

fn open_issues() -> Ast {
    let mut ast = Ast::table("issues");
    ast.and_where(common::query::cmp(
        common::query::column("open"),
        common::query::CmpOp::Eq,
        common::query::literal(common::value::SqlValue::Integer(1)),
    ));
    ast
}

#[tokio::test]
async fn test_initial_hydration_poke() -> anyhow::Result<()> {
    let mut h = Harness::new("g-hydrate")?;
    h.replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![
            ("id", text("i1")),
            ("title", text("hello")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
    )])?;
    h.syncer.version_ready().await?;

    let mut receiver = h.connect("c1").await?;
    h.desire("c1", "q1", open_issues()).await?;

    let messages = drain(&mut receiver);
    assert!(matches!(messages[0], ServerMessage::Connected(..)));
    let ServerMessage::PokeStart(start) = &messages[1] else {
        panic!("expected pokeStart, got {:?}", messages[1]);
    };
    assert_eq!(start.base_cookie, None);
    let ServerMessage::PokePart(part) = &messages[2] else {
        panic!("expected pokePart");
    };
    assert_eq!(part.rows_patch.len(), 1);
    assert!(matches!(
        &part.rows_patch[0],
        RowPatchOp::Put { table, .. } if table == "issues"
    ));
    assert_eq!(part.got_queries_patch.len(), 1);
    assert_eq!(
        part.desired_queries_patches.keys().collect::<Vec<_>>(),
        vec![&ClientId::from("c1")]
    );
    let ServerMessage::PokeEnd(end) = &messages[3] else {
        panic!("expected pokeEnd");
    };
    assert_eq!(end.poke_id, start.poke_id);

    // The CVR recorded the row for the query and marked it gotten.
    let q1 = QueryHash::from("q1");
    assert!(h.syncer.cvr.queries.get(&q1).unwrap().gotten);
    assert_eq!(h.syncer.cvr.rows.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_poke_cookies_are_contiguous() -> anyhow::Result<()> {
    let mut h = Harness::new("g-cookies")?;
    let mut receiver = h.connect("c1").await?;
    h.desire("c1", "q1", open_issues()).await?;

    for i in 0..3 {
        let id = format!("i{i}");
        h.replica.commit(vec![TestMutation::insert(
            RowKey::new("issues", vec![text(&id)]),
            row(vec![
                ("id", text(&id)),
                ("title", text("t")),
                ("open", int(1)),
                ("creatorID", text("u1")),
            ]),
        )])?;
        h.syncer.version_ready().await?;
    }

    let messages = drain(&mut receiver);
    let mut last_cookie: Option<String> = None;
    let mut poke_ends = 0;
    for message in &messages {
        match message {
            ServerMessage::PokeStart(start) => {
                assert_eq!(start.base_cookie, last_cookie, "baseCookie must chain");
            },
            ServerMessage::PokeEnd(end) => {
                if let Some(prev) = &last_cookie {
                    let prev: common::types::CvrVersion = prev.parse()?;
                    let next: common::types::CvrVersion = end.cookie.parse()?;
                    assert!(next > prev, "cookies must be strictly increasing");
                }
                last_cookie = Some(end.cookie.clone());
                poke_ends += 1;
            },
            _ => {},
        }
    }
    assert!(poke_ends >= 4, "expected one poke per transition");
    Ok(())
}

#[tokio::test]
async fn test_client_with_no_delta_gets_no_poke() -> anyhow::Result<()> {
    let mut h = Harness::new("g-nodelta")?;
    let mut r1 = h.connect("c1").await?;
    let mut r2 = h.connect("c2").await?;
    h.desire("c1", "q1", open_issues()).await?;
    drain(&mut r1);
    drain(&mut r2);

    h.replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![
            ("id", text("i1")),
            ("title", text("t")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
    )])?;
    h.syncer.version_ready().await?;

    assert!(!pokes_of(&drain(&mut r1)).is_empty());
    // c2 desires nothing; it must not be poked.
    assert!(pokes_of(&drain(&mut r2)).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_idempotent_patch_produces_no_second_poke() -> anyhow::Result<()> {
    let mut h = Harness::new("g-idempotent")?;
    let mut receiver = h.connect("c1").await?;
    h.desire("c1", "q1", open_issues()).await?;
    drain(&mut receiver);

    h.desire("c1", "q1", open_issues()).await?;
    assert!(pokes_of(&drain(&mut receiver)).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_removing_query_deletes_invisible_rows() -> anyhow::Result<()> {
    let mut h = Harness::new("g-remove")?;
    h.replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![
            ("id", text("i1")),
            ("title", text("t")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
    )])?;
    h.syncer.version_ready().await?;
    let mut receiver = h.connect("c1").await?;
    h.desire("c1", "q1", open_issues()).await?;
    drain(&mut receiver);

    let patch = vec![DesiredQueryPatchOp::Del { hash: "q1".into() }];
    h.syncer
        .change_desired_queries(&ClientId::from("c1"), &patch)
        .await?;
    let messages = drain(&mut receiver);
    let dels: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::PokePart(part) => Some(part.rows_patch.clone()),
            _ => None,
        })
        .flatten()
        .filter(|op| matches!(op, RowPatchOp::Del { .. }))
        .collect();
    assert_eq!(dels.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_shared_transformation_reports_identical_metrics() -> anyhow::Result<()> {
    let mut h = Harness::new("g-shared")?;
    h.replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![
            ("id", text("i1")),
            ("title", text("t")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
    )])?;
    h.syncer.version_ready().await?;
    let mut r1 = h.connect("c1").await?;
    let mut r2 = h.connect("c2").await?;

    // Distinct query hashes, identical AST: one transformation, one
    // hydration, one metric series.
    h.desire("c1", "qa", open_issues()).await?;
    h.desire("c2", "qb", open_issues()).await?;
    drain(&mut r1);
    drain(&mut r2);

    let th = {
        let (ast, th, _) = h
            .syncer
            .transformer()
            .transform_ast(open_issues(), None);
        assert_eq!(th, ast.transformation_hash());
        th
    };
    let d1 = h
        .syncer
        .query_metrics
        .series_digest(QueryMetric::MaterializationServer, th.as_str());
    assert_eq!(d1.count, 1, "one hydration for the shared transformation");

    // Both query hashes resolve to the same rows in the CVR.
    let q_a = QueryHash::from("qa");
    let q_b = QueryHash::from("qb");
    for row_record in h.syncer.cvr.rows.values() {
        assert_eq!(
            row_record.ref_counts.get(&q_a),
            row_record.ref_counts.get(&q_b)
        );
    }

    // An update flows through the shared pipeline once and lands one
    // sample in the shared update series.
    h.replica.commit(vec![TestMutation::update(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![
            ("id", text("i1")),
            ("title", text("t")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
        row(vec![
            ("id", text("i1")),
            ("title", text("t2")),
            ("open", int(1)),
            ("creatorID", text("u1")),
        ]),
    )])?;
    h.syncer.version_ready().await?;
    let update_digest = h
        .syncer
        .query_metrics
        .series_digest(QueryMetric::UpdateServer, th.as_str());
    assert_eq!(update_digest.count, 1);
    Ok(())
}

#[tokio::test]
async fn test_unauthenticated_inspect_rejected() -> anyhow::Result<()> {
    let mut h = Harness::new("g-inspect-unauth")?;
    let _receiver = h.connect("c1").await?;
    let response = h
        .syncer
        .handle_inspect(
            &ClientId::from("c1"),
            InspectUp::Version { id: "1".into() },
        )
        .await;
    // No version leakage: the op is rejected without side effects.
    assert_eq!(
        response,
        InspectDown::Authenticated {
            id: "1".into(),
            value: false,
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_inspect_queries_after_authentication() -> anyhow::Result<()> {
    let mut h = Harness::new("g-inspect-queries")?;
    h.syncer.set_dev_mode(true);
    let mut receiver = h.connect("c1").await?;
    h.desire("c1", "q1", open_issues()).await?;
    drain(&mut receiver);

    let response = h
        .syncer
        .handle_inspect(
            &ClientId::from("c1"),
            InspectUp::Queries {
                id: "2".into(),
                client_id: None,
            },
        )
        .await;
    let InspectDown::Queries { value, .. } = response else {
        panic!("expected queries response, got {response:?}");
    };
    assert_eq!(value.len(), 1);
    assert_eq!(value[0].query_hash, QueryHash::from("q1"));
    assert!(value[0].gotten);
    assert!(value[0].transformed_ast.is_some());
    Ok(())
}

#[tokio::test]
async fn test_mutation_error_delivered_with_lmid_advance() -> anyhow::Result<()> {
    let mut h = Harness::new("g-mutations")?;
    let mut receiver = h.connect("c1").await?;
    drain(&mut receiver);

    // The push processor reports an app error for mutation 1 before the
    // replicator reflects the lmid advance.
    let error_result = MutationResponse {
        id: MutationId {
            client_id: ClientId::from("c1"),
            id: 1,
        },
        result: MutationResult::Error {
            error: MutationErrorKind::App,
            message: "...test ".into(),
            details: None,
        },
    };
    h.syncer.handle_mutation_results(vec![error_result.clone()])?;
    // Not yet delivered: the lmid has not passed mutation 1.
    assert!(pokes_of(&drain(&mut receiver)).is_empty());

    // The replicator catches up: lmid jumps to 5.
    h.replica.commit(vec![TestMutation::insert(
        RowKey::new("_sync_clients", vec![text("g-mutations"), text("c1")]),
        row(vec![
            ("clientGroupID", text("g-mutations")),
            ("clientID", text("c1")),
            ("lastMutationID", int(5)),
        ]),
    )])?;
    h.syncer.version_ready().await?;

    let messages = drain(&mut receiver);
    let parts: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::PokePart(part) => Some(part),
            _ => None,
        })
        .collect();
    assert_eq!(parts.len(), 1);
    assert_eq!(
        parts[0].last_mutation_id_changes,
        btreemap! {ClientId::from("c1") => 5}
    );
    // The error result rides the same poke that advances the lmid past it;
    // mutations 2..5 resolve through the lmid alone.
    assert_eq!(parts[0].mutations_patch, vec![error_result]);
    Ok(())
}

#[tokio::test]
async fn test_schema_mismatch_rejected() -> anyhow::Result<()> {
    let mut h = Harness::new("g-schema")?;
    let init = InitConnectionBody {
        client_schema: Some(serde_json::json!({"tables": ["issues"]})),
        ..Default::default()
    };
    let _receiver = h.connect_with_init("c1", init).await?;

    let mismatched = InitConnectionBody {
        client_schema: Some(serde_json::json!({"tables": ["issues", "users"]})),
        ..Default::default()
    };
    let err = h.connect_with_init("c2", mismatched).await.unwrap_err();
    assert!(err.to_string().contains("schema"));
    use errors::ErrorMetadataAnyhowExt as _;
    assert_eq!(err.short_msg(), "SchemaVersionNotSupported");
    Ok(())
}

#[tokio::test]
async fn test_base_cookie_mismatch_rejected() -> anyhow::Result<()> {
    let mut h = Harness::new("g-basecookie")?;
    let params = ConnectParams {
        client_id: ClientId::from("c1"),
        client_group_id: h.syncer.client_group_id().clone(),
        user_id: None,
        base_cookie: Some("ff:0".into()),
        ts: None,
        lmid: 0,
        ws_id: None,
        debug_perf: false,
    };
    let err = h
        .syncer
        .init_connection(params, InitConnectionBody::default(), None)
        .await
        .unwrap_err();
    use errors::ErrorMetadataAnyhowExt as _;
    assert_eq!(err.short_msg(), "InvalidConnectionRequestBaseCookie");
    Ok(())
}

#[tokio::test]
async fn test_unknown_client_with_lmid_is_client_not_found() -> anyhow::Result<()> {
    let mut h = Harness::new("g-clientnotfound")?;
    let params = ConnectParams {
        client_id: ClientId::from("ghost"),
        client_group_id: h.syncer.client_group_id().clone(),
        user_id: None,
        base_cookie: None,
        ts: None,
        lmid: 7,
        ws_id: None,
        debug_perf: false,
    };
    let err = h
        .syncer
        .init_connection(params, InitConnectionBody::default(), None)
        .await
        .unwrap_err();
    use errors::ErrorMetadataAnyhowExt as _;
    assert_eq!(err.short_msg(), "ClientNotFound");
    Ok(())
}
