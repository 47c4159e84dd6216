use std::{
    sync::Arc,
    time::Duration,
};

use backend::{
    router,
    spawn_version_poller,
    RouterState,
    SyncerRegistry,
    SyncerRegistryConfig,
};
use common::{
    query::Ast,
    value::RowKey,
};
use cvr::CvrStore;
use futures::{
    SinkExt as _,
    StreamExt as _,
};
use replica::testing::{
    int,
    row,
    text,
    TestMutation,
    TestReplica,
};
use sync_types::{
    ClientMessage,
    DesiredQueryPatchOp,
    QuerySpec,
    ServerMessage,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    MaybeTlsStream,
    WebSocketStream,
};
use transform::{
    Permissions,
    Transformer,
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(replica: &TestReplica) -> anyhow::Result<String> {
    let store = Arc::new(CvrStore::in_memory()?);
    let transformer = Arc::new(Transformer::new(Arc::new(Permissions::empty())));
    let version_rx = spawn_version_poller(replica.path.clone(), Duration::from_millis(25));
    let registry = Arc::new(SyncerRegistry::new(
        SyncerRegistryConfig {
            replica_path: replica.path.clone(),
            build_version: "integration-test".into(),
            dev_mode: true,
        },
        store,
        transformer,
        version_rx,
    ));
    let app = router(RouterState { registry });
    let port = portpicker::pick_unused_port().expect("No ports free");
    let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("127.0.0.1:{port}"))
}

async fn ws_connect(addr: &str, client_id: &str, group: &str) -> anyhow::Result<Socket> {
    let url = format!("ws://{addr}/sync/v3/connect?clientID={client_id}&clientGroupID={group}");
    let socket = loop {
        match connect_async(&url).await {
            Ok((socket, _)) => break socket,
            Err(_) => tokio::task::yield_now().await,
        }
    };
    Ok(socket)
}

async fn next_server_message(socket: &mut Socket) -> anyhow::Result<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("Socket closed"))?;
        match frame? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => anyhow::bail!("Unexpected frame {other:?}"),
        }
    }
}

async fn send_client_message(socket: &mut Socket, message: &ClientMessage) -> anyhow::Result<()> {
    let serialized = serde_json::to_string(message)?;
    socket.send(Message::Text(serialized.into())).await?;
    Ok(())
}

fn issue_tracker(replica: &TestReplica) -> anyhow::Result<()> {
    replica.create_table(
        "issues",
        &["id"],
        "CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, open INTEGER)",
    )?;
    Ok(())
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
async fn test_connect_subscribe_and_poke() -> anyhow::Result<()> {
    let mut replica = TestReplica::new()?;
    issue_tracker(&replica)?;
    replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i1")]),
        row(vec![("id", text("i1")), ("title", text("hello")), ("open", int(1))]),
    )])?;

    let addr = start_server(&replica).await?;
    let mut socket = ws_connect(&addr, "c1", "g1").await?;

    let connected = next_server_message(&mut socket).await?;
    assert!(matches!(connected, ServerMessage::Connected(..)));

    // Subscribe; the initial hydration arrives as one poke.
    let subscribe = ClientMessage::ChangeDesiredQueries(sync_types::ChangeDesiredQueriesBody {
        desired_queries_patch: vec![DesiredQueryPatchOp::Put {
            hash: "q1".into(),
            query: QuerySpec::Ast { ast: open_issues() },
            ttl_ms: Some(60_000),
        }],
    });
    send_client_message(&mut socket, &subscribe).await?;

    let ServerMessage::PokeStart(start) = next_server_message(&mut socket).await? else {
        panic!("expected pokeStart");
    };
    let ServerMessage::PokePart(part) = next_server_message(&mut socket).await? else {
        panic!("expected pokePart");
    };
    assert_eq!(part.poke_id, start.poke_id);
    assert_eq!(part.rows_patch.len(), 1);
    assert_eq!(part.got_queries_patch.len(), 1);
    let ServerMessage::PokeEnd(first_end) = next_server_message(&mut socket).await? else {
        panic!("expected pokeEnd");
    };

    // A replicated write flows through as an incremental poke.
    replica.commit(vec![TestMutation::insert(
        RowKey::new("issues", vec![text("i2")]),
        row(vec![("id", text("i2")), ("title", text("again")), ("open", int(1))]),
    )])?;
    let ServerMessage::PokeStart(start) = next_server_message(&mut socket).await? else {
        panic!("expected second pokeStart");
    };
    assert_eq!(start.base_cookie.as_deref(), Some(first_end.cookie.as_str()));
    let ServerMessage::PokePart(part) = next_server_message(&mut socket).await? else {
        panic!("expected second pokePart");
    };
    assert_eq!(part.rows_patch.len(), 1);
    let ServerMessage::PokeEnd(second_end) = next_server_message(&mut socket).await? else {
        panic!("expected second pokeEnd");
    };
    let first: common::types::CvrVersion = first_end.cookie.parse().unwrap();
    let second: common::types::CvrVersion = second_end.cookie.parse().unwrap();
    assert!(second > first);

    // Ping round trip on the application protocol.
    send_client_message(&mut socket, &ClientMessage::Ping).await?;
    assert!(matches!(
        next_server_message(&mut socket).await?,
        ServerMessage::Pong
    ));

    socket.close(None).await?;
    Ok(())
}

#[tokio::test]
async fn test_connect_rejects_missing_params() -> anyhow::Result<()> {
    let replica = TestReplica::new()?;
    issue_tracker(&replica)?;
    let addr = start_server(&replica).await?;

    // Missing clientGroupID: the upgrade is refused outright.
    let url = format!("ws://{addr}/sync/v3/connect?clientID=c1");
    let result = connect_async(&url).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_unsupported_protocol_version() -> anyhow::Result<()> {
    let replica = TestReplica::new()?;
    issue_tracker(&replica)?;
    let addr = start_server(&replica).await?;

    let url = format!("ws://{addr}/sync/v999/connect?clientID=c1&clientGroupID=g1");
    let result = connect_async(&url).await;
    assert!(result.is_err());
    Ok(())
}
