use std::borrow::Cow;

use http::StatusCode;
use tungstenite::protocol::{
    frame::coding::CloseCode,
    CloseFrame,
};

mod metrics;

pub use crate::metrics::log_errors_reported_total;

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// codebase to tag errors with information used to classify them at the
/// transport boundary.
///
/// The msg is conveyed as a client facing error message if it makes it all
/// the way out of the sync pipeline.
///
/// The short_msg is a tag - available for tests and for metrics logging -
/// that is resilient to changes in copy. The WebSocket close frame and the
/// wire error payload both carry it.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg InvalidConnectionRequest
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    ClientDisconnect,

    Overloaded,
    RateLimited,

    /// Optimistic concurrency conflict on the CVR store. Retried internally;
    /// only escapes as an operational error when the retry also conflicts.
    Conflict,

    OperationalInternalServerError,
}

const CLIENT_DISCONNECTED: &str = "ClientDisconnected";
const CLIENT_DISCONNECTED_MSG: &str = "Client disconnected unexpectedly";
const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
const INTERNAL_SERVER_ERROR_MSG: &str =
    "Your request couldn't be completed. Try again in a few seconds.";

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP and a policy close code on the
    /// WebSocket.
    ///
    /// The short_msg should be CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Client disconnected the connection.
    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: CLIENT_DISCONNECTED.into(),
            msg: CLIENT_DISCONNECTED_MSG.into(),
        }
    }

    /// A defensive limit was hit. The client should back off and retry.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The client exceeded a rate limit. Retryable with backoff; must not
    /// tear down the connection.
    pub fn rate_limited(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Optimistic concurrency conflict. Internal; the coordinator retries.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Operational Internal Server Error (maps to 500 in HTTP).
    ///
    /// Produces a very general error message for the user. Anyhow errors with
    /// no ErrorMetadata attached are treated the same way at the boundary.
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    fn close_code(&self) -> CloseCode {
        match self.code {
            ErrorCode::BadRequest => CloseCode::Policy,
            ErrorCode::Unauthenticated => CloseCode::Policy,
            ErrorCode::Forbidden => CloseCode::Policy,
            ErrorCode::NotFound => CloseCode::Policy,
            ErrorCode::ClientDisconnect => CloseCode::Away,
            ErrorCode::Overloaded => CloseCode::Again,
            ErrorCode::RateLimited => CloseCode::Again,
            ErrorCode::Conflict => CloseCode::Error,
            ErrorCode::OperationalInternalServerError => CloseCode::Error,
        }
    }

    pub fn close_frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.close_code(),
            reason: self.short_msg.to_string().into(),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ClientDisconnect => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors caused by the client's own request. The client should not
    /// retry them verbatim.
    pub fn is_deterministic_user_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::BadRequest
                | ErrorCode::Unauthenticated
                | ErrorCode::Forbidden
                | ErrorCode::NotFound
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Overloaded | ErrorCode::RateLimited | ErrorCode::Conflict
        )
    }

    pub fn metric_status_label_value(&self) -> &'static str {
        match self.code {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ClientDisconnect => "client_disconnect",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Conflict => "conflict",
            ErrorCode::OperationalInternalServerError => "internal",
        }
    }
}

/// Downcast helpers for anyhow chains that may carry an ErrorMetadata.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;

    fn is_deterministic_user_error(&self) -> bool {
        self.error_metadata()
            .map(|em| em.is_deterministic_user_error())
            .unwrap_or(false)
    }

    fn is_unauthenticated(&self) -> bool {
        self.error_metadata()
            .map(|em| em.code == ErrorCode::Unauthenticated)
            .unwrap_or(false)
    }

    fn is_client_disconnect(&self) -> bool {
        self.error_metadata()
            .map(|em| em.code == ErrorCode::ClientDisconnect)
            .unwrap_or(false)
    }

    fn is_rate_limited(&self) -> bool {
        self.error_metadata()
            .map(|em| em.code == ErrorCode::RateLimited)
            .unwrap_or(false)
    }

    fn short_msg(&self) -> &str {
        self.error_metadata()
            .map(|em| em.short_msg.as_ref())
            .unwrap_or(INTERNAL_SERVER_ERROR)
    }

    fn user_facing_message(&self) -> String {
        self.error_metadata()
            .map(|em| em.msg.to_string())
            .unwrap_or_else(|| INTERNAL_SERVER_ERROR_MSG.to_string())
    }

    fn close_frame(&self) -> Option<CloseFrame> {
        self.error_metadata().map(|em| em.close_frame())
    }

    fn http_status(&self) -> StatusCode {
        self.error_metadata()
            .map(|em| em.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Should this error page an operator? Expected client-caused conditions
    /// don't.
    fn should_report(&self) -> bool {
        match self.error_metadata() {
            Some(em) => !em.is_deterministic_user_error() && em.code != ErrorCode::ClientDisconnect,
            None => true,
        }
    }
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        for cause in self.chain() {
            if let Some(em) = cause.downcast_ref::<ErrorMetadata>() {
                return Some(em);
            }
        }
        None
    }
}

/// Log an error to tracing and bump the reported-error counter. Call this at
/// the outermost layer that swallows an error rather than propagating it.
pub fn report_error(e: &mut anyhow::Error) {
    if e.should_report() {
        metrics::log_errors_reported_total();
        tracing::error!("Caught error: {e:#}");
    } else {
        tracing::debug!("Caught expected error: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    #[test]
    fn test_metadata_survives_context_chain() {
        let err: anyhow::Error = anyhow::anyhow!("root cause")
            .context(ErrorMetadata::bad_request("BadThing", "a bad thing happened"))
            .context("outer layer");
        let em = err.error_metadata().expect("metadata lost in chain");
        assert_eq!(em.short_msg, "BadThing");
        assert!(err.is_deterministic_user_error());
        assert!(!err.should_report());
    }

    #[test]
    fn test_plain_anyhow_is_internal() {
        let err = anyhow::anyhow!("whoops");
        assert!(err.error_metadata().is_none());
        assert_eq!(err.short_msg(), "InternalServerError");
        assert!(err.should_report());
        assert!(err.close_frame().is_none());
    }

    #[test]
    fn test_rate_limited_is_retryable_and_not_user_error() {
        let em = ErrorMetadata::rate_limited("MutationRateLimited", "slow down");
        assert!(em.is_retryable());
        assert!(!em.is_deterministic_user_error());
    }
}
