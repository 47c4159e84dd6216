use common::types::MutationId;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// Error kinds carried on the wire. The client's recovery strategy is keyed
/// off this value, so renames are protocol changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidMessage,
    InvalidConnectionRequest,
    InvalidConnectionRequestBaseCookie,
    InvalidConnectionRequestLastMutationID,
    Internal,
    Unauthorized,
    AuthInvalidated,
    Rehome,
    ServerOverloaded,
    MutationRateLimited,
    VersionNotSupported,
    SchemaVersionNotSupported,
    ClientNotFound,
    PushFailed,
    TransformFailed,
}

impl ErrorKind {
    /// Fatal kinds tear down client state; the rest are retryable after
    /// reconnect or backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidConnectionRequest
                | ErrorKind::InvalidConnectionRequestBaseCookie
                | ErrorKind::InvalidConnectionRequestLastMutationID
                | ErrorKind::VersionNotSupported
                | ErrorKind::SchemaVersionNotSupported
                | ErrorKind::ClientNotFound
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_params: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_ids: Option<Vec<MutationId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_ids: Option<Vec<String>>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
            reconnect_params: None,
            min_backoff_ms: None,
            max_backoff_ms: None,
            mutation_ids: None,
            query_ids: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        ErrorBody,
        ErrorKind,
    };

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorKind::InvalidConnectionRequestBaseCookie).unwrap(),
            serde_json::json!("InvalidConnectionRequestBaseCookie")
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::ServerOverloaded).unwrap(),
            serde_json::json!("ServerOverloaded")
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let body = ErrorBody::new(ErrorKind::Internal, "boom");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "Internal", "message": "boom"}));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorKind::ClientNotFound.is_fatal());
        assert!(!ErrorKind::ServerOverloaded.is_fatal());
        assert!(!ErrorKind::MutationRateLimited.is_fatal());
    }
}
