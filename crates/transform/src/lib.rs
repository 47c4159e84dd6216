//! Custom-query transformation (C3).
//!
//! Named queries arrive as `(name, args)` and are resolved to canonical ASTs
//! by an out-of-process HTTP resolver operated by the application. The
//! resolved AST is then rewritten under the row-level permission policy, and
//! the transformation hash is computed from the rewritten AST, so queries
//! that resolve and rewrite identically share a pipeline.

mod permissions;

pub use permissions::{
    apply_permissions,
    Permissions,
    PolicyCondition,
    PolicyOperand,
    TablePolicy,
    NO_AUTH_WARNING,
};

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use common::{
    knobs::TRANSFORMER_DEADLINE,
    query::Ast,
    types::{
        QueryHash,
        TransformationHash,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use sync_types::MutationErrorKind;

#[derive(thiserror::Error, Debug)]
pub enum TransformerError {
    /// The resolver could not be reached within the deadline. Affected
    /// queries stay untransformed; the caller retries later.
    #[error("Transformer unreachable: {0}")]
    Unreachable(String),
    /// The resolver answered but omitted one of the requested queries.
    #[error("Transformer returned no result for query {0}")]
    NoResult(QueryHash),
}

/// One named query to resolve.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomQueryRecord {
    pub id: QueryHash,
    pub name: String,
    pub args: Vec<JsonValue>,
}

/// Per-query outcome of a transform round trip.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOutcome {
    Transformed {
        id: QueryHash,
        ast: Ast,
        transformation_hash: TransformationHash,
        warnings: Vec<String>,
    },
    Error {
        id: QueryHash,
        error: MutationErrorKind,
        message: String,
        details: Option<JsonValue>,
    },
}

impl TransformOutcome {
    pub fn id(&self) -> &QueryHash {
        match self {
            TransformOutcome::Transformed { id, .. } | TransformOutcome::Error { id, .. } => id,
        }
    }
}

/// Request-scoped options: forwarded headers (cookies, api keys) and the
/// connection's decoded auth data for the permission rewrite.
#[derive(Clone, Debug, Default)]
pub struct TransformOptions {
    pub headers: Vec<(String, String)>,
    pub auth_data: Option<JsonValue>,
    /// Overrides the configured deadline; tests use short values.
    pub deadline: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResolverItem {
    Success {
        id: QueryHash,
        ast: Ast,
    },
    Failure {
        id: QueryHash,
        error: MutationErrorKind,
        message: String,
        #[serde(default)]
        details: Option<JsonValue>,
    },
}

pub struct Transformer {
    client: reqwest::Client,
    permissions: Arc<Permissions>,
}

impl Transformer {
    pub fn new(permissions: Arc<Permissions>) -> Self {
        Self {
            client: reqwest::Client::new(),
            permissions,
        }
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Rewrite an already-canonical AST (a query the client sent inline)
    /// under the permission policy.
    pub fn transform_ast(
        &self,
        ast: Ast,
        auth_data: Option<&JsonValue>,
    ) -> (Ast, TransformationHash, Vec<String>) {
        let (rewritten, warnings) = apply_permissions(ast, &self.permissions, auth_data);
        let hash = rewritten.transformation_hash();
        (rewritten, hash, warnings)
    }

    /// Resolve named queries through the user's resolver endpoint, then apply
    /// the permission rewrite. Deterministic given identical inputs and
    /// resolver responses.
    pub async fn transform(
        &self,
        options: &TransformOptions,
        queries: &[CustomQueryRecord],
        user_query_url: &str,
    ) -> Result<Vec<TransformOutcome>, TransformerError> {
        if queries.is_empty() {
            return Ok(vec![]);
        }
        let deadline = options.deadline.unwrap_or(*TRANSFORMER_DEADLINE);
        let mut request = self
            .client
            .post(user_query_url)
            .timeout(deadline)
            .json(queries);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransformerError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransformerError::Unreachable(format!(
                "Resolver returned {status}"
            )));
        }
        let items: Vec<ResolverItem> = response
            .json()
            .await
            .map_err(|e| TransformerError::Unreachable(format!("Invalid resolver body: {e}")))?;

        let mut by_id: BTreeMap<QueryHash, ResolverItem> = BTreeMap::new();
        for item in items {
            let id = match &item {
                ResolverItem::Success { id, .. } | ResolverItem::Failure { id, .. } => id.clone(),
            };
            by_id.insert(id, item);
        }

        let mut outcomes = Vec::with_capacity(queries.len());
        for record in queries {
            let item = by_id
                .remove(&record.id)
                .ok_or_else(|| TransformerError::NoResult(record.id.clone()))?;
            let outcome = match item {
                ResolverItem::Success { id, ast } => {
                    let (ast, transformation_hash, warnings) =
                        self.transform_ast(ast, options.auth_data.as_ref());
                    TransformOutcome::Transformed {
                        id,
                        ast,
                        transformation_hash,
                        warnings,
                    }
                },
                ResolverItem::Failure {
                    id,
                    error,
                    message,
                    details,
                } => {
                    tracing::info!("Resolver rejected query {id}: {message}");
                    TransformOutcome::Error {
                        id,
                        error,
                        message,
                        details,
                    }
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
