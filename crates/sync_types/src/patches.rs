use common::{
    query::Ast,
    types::{
        MutationId,
        QueryHash,
    },
    value::{
        RowData,
        SqlValue,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// How the client described a query: an inline AST, or a named custom query
/// resolved out of process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySpec {
    Ast { ast: Ast },
    Custom { name: String, args: Vec<JsonValue> },
}

impl QuerySpec {
    /// The client-side fingerprint of the query, before transformation.
    pub fn query_hash(&self) -> QueryHash {
        match self {
            QuerySpec::Ast { ast } => ast.query_hash(),
            QuerySpec::Custom { name, args } => {
                let canonical = serde_json::json!({ "name": name, "args": args });
                QueryHash::from(common::sha256::sha256_hex(canonical.to_string().as_bytes()))
            },
        }
    }
}

/// One entry of a client's desired-queries patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DesiredQueryPatchOp {
    Put {
        hash: QueryHash,
        #[serde(flatten)]
        query: QuerySpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<u64>,
    },
    Del {
        hash: QueryHash,
    },
    Clear,
}

/// Server acknowledgement that a query's initial rows have been delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum GotQueryPatchOp {
    Put { hash: QueryHash },
    Del { hash: QueryHash },
}

/// Idempotent row set operations keyed by `(table, id)`. Order within one
/// poke does not matter for correctness.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowPatchOp {
    Put {
        table: String,
        id: Vec<SqlValue>,
        value: RowData,
    },
    Del {
        table: String,
        id: Vec<SqlValue>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationErrorKind {
    App,
    Http,
    Zero,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResult {
    Error {
        error: MutationErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
    Ok {},
}

impl MutationResult {
    pub fn is_error(&self) -> bool {
        matches!(self, MutationResult::Error { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub id: MutationId,
    pub result: MutationResult,
}

/// Per-query transformation failure, delivered only to the clients whose
/// queries triggered it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformErrorBody {
    pub query_hashes: Vec<QueryHash>,
    pub error: MutationErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}
