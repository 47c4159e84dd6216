use common::{
    knobs::CLIENT_QUEUE_SIZE,
    types::{
        ClientId,
        CvrVersion,
        WsId,
    },
};
use sync_types::ServerMessage;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::metrics;

/// Why the syncer is force-closing a connection. Delivered out of band so a
/// full outbound queue cannot block the close itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseSignal {
    /// The client's outbound queue overflowed; it must reconnect and
    /// re-hydrate.
    SlowConsumer,
    /// Orderly shutdown of the view syncer.
    ShuttingDown,
}

impl CloseSignal {
    pub fn reason(&self) -> &'static str {
        match self {
            CloseSignal::SlowConsumer => "SlowConsumer",
            CloseSignal::ShuttingDown => "ShuttingDown",
        }
    }
}

/// The syncer-side handle for one connected client. Owns a bounded outbound
/// queue; the websocket writer drains the other end. Pushes never block the
/// coordinator: a full queue marks the client slow and the handler is torn
/// down.
pub struct ClientHandle {
    pub client_id: ClientId,
    pub ws_id: Option<WsId>,
    tx: mpsc::Sender<ServerMessage>,
    close_tx: Option<oneshot::Sender<CloseSignal>>,
    /// The last poke cookie this connection was sent; the next poke's
    /// baseCookie. `None` until the first poke (or the client's verified
    /// connect cookie).
    pub last_cookie: Option<CvrVersion>,
}

/// The transport side: the websocket writer consumes `messages`, and a
/// receipt on `close` tells it to close the socket with that reason.
#[derive(Debug)]
pub struct ClientReceiver {
    pub messages: mpsc::Receiver<ServerMessage>,
    pub close: oneshot::Receiver<CloseSignal>,
}

impl ClientHandle {
    pub fn new(
        client_id: ClientId,
        ws_id: Option<WsId>,
        base_cookie: Option<CvrVersion>,
    ) -> (Self, ClientReceiver) {
        let (tx, rx) = mpsc::channel(*CLIENT_QUEUE_SIZE);
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                client_id,
                ws_id,
                tx,
                close_tx: Some(close_tx),
                last_cookie: base_cookie,
            },
            ClientReceiver {
                messages: rx,
                close: close_rx,
            },
        )
    }

    /// Queue a message without suspending. `Err` means the client could not
    /// keep up (or disconnected); the caller removes the handler.
    pub fn send(&self, message: ServerMessage) -> Result<(), CloseSignal> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::log_slow_consumer();
                Err(CloseSignal::SlowConsumer)
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CloseSignal::ShuttingDown),
        }
    }

    /// Signal the transport to close the socket. Consumes the close channel;
    /// subsequent calls are no-ops.
    pub fn close(&mut self, signal: CloseSignal) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(signal);
        }
    }
}
