//! The sync WebSocket endpoint.
//!
//! Three asynchronous processes per connection: a receive loop parsing
//! frames into the view syncer's queue, a send loop draining the client's
//! bounded outbound queue (plus heartbeat pings), and the view syncer
//! itself, which runs independently per client group. Neither loop ever
//! blocks the syncer: back-pressure surfaces as a SlowConsumer close.

use std::time::{
    Duration,
    Instant,
};

use axum::{
    body::Bytes,
    extract::{
        ws::{
            CloseFrame,
            Message,
            WebSocket,
        },
        Path,
        RawQuery,
        State,
        WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{
        IntoResponse,
        Response,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt as _,
};
use futures::{
    SinkExt as _,
    StreamExt as _,
};
use parking_lot::Mutex;
use sync::{
    ClientReceiver,
    CloseSignal,
    ViewSyncerHandle,
};
use sync_types::{
    decode_protocol_header,
    ClientMessage,
    ConnectParams,
    ConnectParamsError,
    ErrorBody,
    ErrorKind,
    HeaderPayload,
    InitConnectionBody,
    ServerMessage,
    PROTOCOL_VERSION,
};

use crate::{
    ws::is_connection_closed_error,
    RouterState,
};

/// How often heartbeat pings are sent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client traffic causes a timeout.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn sync(
    State(st): State<RouterState>,
    Path(version): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let protocol_version: u32 = match version.strip_prefix('v').and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => {
            return error_response(ErrorKind::VersionNotSupported, "Malformed protocol version")
        },
    };
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(
        query.unwrap_or_default().as_bytes(),
    )
    .map(|(k, v)| (k.into_owned(), v.into_owned()))
    .collect();
    let params = match ConnectParams::parse(protocol_version, pairs) {
        Ok(params) => params,
        Err(e) => {
            let kind = match e {
                ConnectParamsError::VersionNotSupported(..) => ErrorKind::VersionNotSupported,
                _ => ErrorKind::InvalidConnectionRequest,
            };
            return error_response(kind, &e.to_string());
        },
    };

    // The protocol header smuggles either a full initConnection payload or
    // (past the header length cap) a bare auth token.
    let header_payload = headers
        .get(http::header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(|raw| (raw.to_owned(), decode_protocol_header(raw)));

    let handle = st.registry.handle_for(&params.client_group_id);
    let mut upgrade = ws;
    if let Some((raw, _)) = &header_payload {
        // Echo the subprotocol so browsers accept the upgrade.
        upgrade = upgrade.protocols([raw.clone()]);
    }
    upgrade.on_upgrade(move |socket| {
        run_sync_socket(handle, params, header_payload.map(|(_, p)| p), socket)
    })
}

fn error_response(kind: ErrorKind, message: &str) -> Response {
    (
        http::StatusCode::BAD_REQUEST,
        serde_json::to_string(&ErrorBody::new(kind, message)).unwrap_or_default(),
    )
        .into_response()
}

/// Decode the auth token into permission auth data. Token issuance and
/// verification are a collaborator's concern; this shell accepts tokens
/// whose payload is plain JSON.
fn auth_data_from_token(token: &str) -> Option<serde_json::Value> {
    serde_json::from_str(token).ok()
}

async fn run_sync_socket(
    handle: ViewSyncerHandle,
    params: ConnectParams,
    header_payload: Option<HeaderPayload>,
    socket: WebSocket,
) {
    crate::subs::metrics::log_sync_protocol_websockets_total(1);
    let result = drive_sync_socket(handle, params, header_payload, socket).await;
    if let Err(mut e) = result {
        if e.is_client_disconnect() || is_connection_closed_error(e.as_ref()) {
            crate::subs::metrics::log_websocket_connection_reset();
        } else {
            errors::report_error(&mut e);
        }
    }
    crate::subs::metrics::log_sync_protocol_websockets_total(-1);
    crate::subs::metrics::log_websocket_closed();
}

async fn drive_sync_socket(
    handle: ViewSyncerHandle,
    params: ConnectParams,
    header_payload: Option<HeaderPayload>,
    socket: WebSocket,
) -> anyhow::Result<()> {
    let (init, auth_data) = match header_payload {
        Some(HeaderPayload::InitConnection(body)) => {
            let auth = body.auth_token.as_deref().and_then(auth_data_from_token);
            (body, auth)
        },
        Some(HeaderPayload::AuthToken(token)) => {
            // The client re-sends initConnection as its first application
            // message.
            let auth = auth_data_from_token(&token);
            (
                InitConnectionBody {
                    auth_token: Some(token),
                    ..Default::default()
                },
                auth,
            )
        },
        None => (InitConnectionBody::default(), None),
    };

    let client_id = params.client_id.clone();
    let receiver = match handle.connect(params, init, auth_data).await {
        Ok(receiver) => receiver,
        Err(e) => {
            send_fatal_error(socket, &e).await;
            return Err(e);
        },
    };
    let ClientReceiver {
        mut messages,
        mut close,
    } = receiver;

    let (mut tx, mut rx) = socket.split();
    let last_received = Mutex::new(Instant::now());

    let receive_messages = async {
        while let Some(message) = rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) if is_connection_closed_error(&e) => {
                    return Err(anyhow::Error::from(ErrorMetadata::client_disconnect())
                        .context(e));
                },
                Err(e) => return Err(e.into()),
            };
            *last_received.lock() = Instant::now();
            match message {
                Message::Text(text) => {
                    crate::subs::metrics::log_websocket_message_in(text.len());
                    let parsed: ClientMessage =
                        serde_json::from_str(&text).map_err(|e| {
                            anyhow::anyhow!(ErrorMetadata::bad_request(
                                "InvalidMessage",
                                format!("Received invalid frame: {e}"),
                            ))
                        })?;
                    handle.message(client_id.clone(), parsed)?;
                },
                Message::Ping(_) | Message::Pong(_) => {},
                Message::Close(_) => break,
                Message::Binary(_) => {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "InvalidMessage",
                        "Binary frames are not part of the protocol",
                    ));
                },
            }
        }
        Ok::<Option<CloseFrame>, anyhow::Error>(None)
    };

    let send_messages = async {
        let mut ping_ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                signal = &mut close => {
                    // The syncer force-closed this connection.
                    let signal = signal.unwrap_or(CloseSignal::ShuttingDown);
                    return Ok(Some(CloseFrame {
                        code: 1008,
                        reason: signal.reason().into(),
                    }));
                },
                maybe_message = messages.recv() => {
                    let Some(message) = maybe_message else {
                        return Ok(None);
                    };
                    crate::subs::metrics::log_websocket_message_out(&message);
                    let serialized = serde_json::to_string(&message)?;
                    if tx.send(Message::Text(serialized.into())).await.is_err() {
                        return Ok(None);
                    }
                },
                _ = ping_ticker.tick() => {
                    if last_received.lock().elapsed() > CLIENT_TIMEOUT {
                        crate::subs::metrics::log_websocket_client_timeout();
                        return Err(anyhow::Error::from(ErrorMetadata::client_disconnect())
                            .context("WebSocket ping timeout"));
                    }
                    if tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        return Ok(None);
                    }
                },
            }
        }
    };

    let result = tokio::try_join!(receive_messages, send_messages);
    handle.disconnect(client_id.clone(), None);

    let mut socket = tx.reunite(rx).expect("Mixed up WebSocket halves?");
    match result {
        Ok((_, close_frame)) => {
            let _ = socket.send(Message::Close(close_frame)).await;
            Ok(())
        },
        Err(e) => {
            if let Some(frame) = e.close_frame() {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: frame.code.into(),
                        reason: frame.reason.to_string().into(),
                    })))
                    .await;
            }
            Err(e)
        },
    }
}

/// Best-effort delivery of a fatal connection error before closing.
async fn send_fatal_error(mut socket: WebSocket, e: &anyhow::Error) {
    let kind = match e.short_msg() {
        "InvalidConnectionRequestBaseCookie" => ErrorKind::InvalidConnectionRequestBaseCookie,
        "InvalidConnectionRequestLastMutationID" => {
            ErrorKind::InvalidConnectionRequestLastMutationID
        },
        "SchemaVersionNotSupported" => ErrorKind::SchemaVersionNotSupported,
        "ClientNotFound" => ErrorKind::ClientNotFound,
        "Unauthorized" => ErrorKind::Unauthorized,
        _ if e.is_deterministic_user_error() => ErrorKind::InvalidConnectionRequest,
        _ => ErrorKind::Internal,
    };
    let body = ErrorBody::new(kind, e.user_facing_message());
    let message = ServerMessage::Error(body);
    if let Ok(serialized) = serde_json::to_string(&message) {
        let _ = socket.send(Message::Text(serialized.into())).await;
    }
    let _ = socket.close().await;
}

pub(crate) mod metrics {
    use metrics::{
        log_counter,
        log_distribution,
        log_gauge_delta,
        register_sync_counter,
        register_sync_gauge,
        register_sync_histogram,
    };
    use sync_types::ServerMessage;

    register_sync_gauge!(
        SYNC_PROTOCOL_WEBSOCKETS_TOTAL,
        "Number of open sync protocol websockets"
    );
    pub fn log_sync_protocol_websockets_total(delta: i64) {
        log_gauge_delta(&SYNC_PROTOCOL_WEBSOCKETS_TOTAL, delta as f64);
    }

    register_sync_histogram!(
        WEBSOCKET_CLIENT_MESSAGE_BYTES,
        "Size of inbound websocket messages"
    );
    pub fn log_websocket_message_in(bytes: usize) {
        log_distribution(&WEBSOCKET_CLIENT_MESSAGE_BYTES, bytes as f64);
    }

    register_sync_counter!(
        WEBSOCKET_MESSAGES_OUT_TOTAL,
        "Outbound websocket messages",
        &["tag"]
    );
    pub fn log_websocket_message_out(message: &ServerMessage) {
        metrics::log_counter_with_labels(
            &WEBSOCKET_MESSAGES_OUT_TOTAL,
            1,
            vec![metrics::MetricLabel::new("tag", message.tag())],
        );
    }

    register_sync_counter!(
        WEBSOCKET_CONNECTION_RESET_TOTAL,
        "Websockets that went away without a close handshake"
    );
    pub fn log_websocket_connection_reset() {
        log_counter(&WEBSOCKET_CONNECTION_RESET_TOTAL, 1);
    }

    register_sync_counter!(
        WEBSOCKET_CLIENT_TIMEOUT_TOTAL,
        "Websockets closed for ping inactivity"
    );
    pub fn log_websocket_client_timeout() {
        log_counter(&WEBSOCKET_CLIENT_TIMEOUT_TOTAL, 1);
    }

    register_sync_counter!(WEBSOCKET_CLOSED_TOTAL, "Websockets closed");
    pub fn log_websocket_closed() {
        log_counter(&WEBSOCKET_CLOSED_TOTAL, 1);
    }
}
