use std::{
    error::Error as StdError,
    io::{
        Error as IoError,
        ErrorKind as IoErrorKind,
    },
};

use tungstenite::error::{
    Error as TungsteniteError,
    ProtocolError,
};

/// Whether an error on the socket is just the peer going away. There's some
/// error-handling sloppiness in the axum to tungstenite close path, so a
/// successful close can still surface as an error; only report errors we
/// can't attribute to a disconnect.
pub fn is_connection_closed_error(e: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(current) = source {
        if matches!(
            current.downcast_ref(),
            Some(
                TungsteniteError::ConnectionClosed
                    | TungsteniteError::AlreadyClosed
                    | TungsteniteError::Protocol(
                        ProtocolError::SendAfterClosing
                            | ProtocolError::ResetWithoutClosingHandshake
                    )
            )
        ) {
            return true;
        }
        if matches!(
            current.downcast_ref::<IoError>(),
            Some(e) if matches!(e.kind(), IoErrorKind::BrokenPipe | IoErrorKind::ConnectionReset)
        ) {
            return true;
        }
        source = current.source();
    }
    false
}
