use common::types::{
    ClientId,
    QueryHash,
    TransformationHash,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::patches::QuerySpec;

/// Inspector requests, received as `inspect` frames. Every op except
/// `authenticate` requires a prior successful authentication for the
/// client group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum InspectUp {
    Authenticate {
        id: String,
        value: String,
    },
    Version {
        id: String,
    },
    Metrics {
        id: String,
    },
    Queries {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
    AnalyzeQuery {
        id: String,
        value: AnalyzeQueryRequest,
    },
}

impl InspectUp {
    pub fn id(&self) -> &str {
        match self {
            InspectUp::Authenticate { id, .. }
            | InspectUp::Version { id }
            | InspectUp::Metrics { id }
            | InspectUp::Queries { id, .. }
            | InspectUp::AnalyzeQuery { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeQueryOptions {
    #[serde(default)]
    pub synced_rows: bool,
    #[serde(default)]
    pub vended_rows: bool,
    #[serde(default)]
    pub join_plans: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeQueryRequest {
    #[serde(flatten)]
    pub query: QuerySpec,
    #[serde(default)]
    pub options: AnalyzeQueryOptions,
}

/// One row of the `queries` op response: CVR query metadata joined with
/// per-query server metrics and the running pipeline's transformed AST.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectQueryRow {
    pub query_hash: QueryHash,
    pub transformation_hash: Option<TransformationHash>,
    pub gotten: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed_ast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization_metrics: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_metrics: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeQueryResult {
    pub warnings: Vec<String>,
    /// Builder-text serialization of the permission-rewritten AST.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_permissions: Option<String>,
    pub start: u64,
    pub end: u64,
    pub synced_row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_rows: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vended_row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vended_rows: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_plans: Option<JsonValue>,
}

/// Inspector responses, sent as `inspect` frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum InspectDown {
    Authenticated {
        id: String,
        value: bool,
    },
    Version {
        id: String,
        value: String,
    },
    Metrics {
        id: String,
        value: JsonValue,
    },
    Queries {
        id: String,
        value: Vec<InspectQueryRow>,
    },
    AnalyzeQuery {
        id: String,
        value: AnalyzeQueryResult,
    },
}
