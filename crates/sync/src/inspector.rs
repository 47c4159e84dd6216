//! The inspector (C6): a read-mostly debug surface over the view syncer and
//! its pipelines, reached through `inspect` frames on the same transport.
//!
//! Every op except `authenticate` requires the client group to have
//! authenticated earlier in the process lifetime (development mode
//! bypasses the gate). `analyze-query` runs against a throwaway snapshot
//! and never mutates any CVR or pipeline.

use std::{
    collections::BTreeMap,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use common::{
    knobs::{
        ADMIN_PASSWORD,
        DEV_MODE,
    },
    query::Ast,
    types::{
        ClientId,
        QueryHash,
    },
    value::RowData,
};
use pipeline::{
    hydration_plan,
    PipelineDriver,
    RowChange,
    WallClockTimer,
};
use query_metrics::QueryMetric;
use serde_json::Value as JsonValue;
use sync_types::{
    AnalyzeQueryRequest,
    AnalyzeQueryResult,
    InspectDown,
    InspectQueryRow,
    InspectUp,
    QuerySpec,
};
use transform::{
    apply_permissions,
    CustomQueryRecord,
    TransformOptions,
    TransformOutcome,
};

use crate::{
    auth_set::AdminAuthSet,
    syncer::ViewSyncer,
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ViewSyncer {
    pub(crate) async fn handle_inspect(
        &mut self,
        client_id: &ClientId,
        op: InspectUp,
    ) -> InspectDown {
        let dev_mode = self.config().dev_mode || *DEV_MODE;
        // Every op except authenticate is rejected without side effects
        // until the group authenticates.
        if !matches!(op, InspectUp::Authenticate { .. })
            && !dev_mode
            && !AdminAuthSet::contains(self.client_group_id())
        {
            return InspectDown::Authenticated {
                id: op.id().to_owned(),
                value: false,
            };
        }
        match op {
            InspectUp::Authenticate { id, value } => {
                let authenticated = dev_mode
                    || ADMIN_PASSWORD
                        .as_ref()
                        .map(|password| password == &value)
                        .unwrap_or(false);
                if authenticated {
                    AdminAuthSet::add(self.client_group_id());
                }
                InspectDown::Authenticated {
                    id,
                    value: authenticated || AdminAuthSet::contains(self.client_group_id()),
                }
            },
            InspectUp::Version { id } => InspectDown::Version {
                id,
                value: self.config().build_version.clone(),
            },
            InspectUp::Metrics { id } => InspectDown::Metrics {
                id,
                value: self.metrics_digests(),
            },
            InspectUp::Queries { id, client_id: target } => {
                let target = target.as_ref().or(Some(client_id));
                match self.query_rows(target) {
                    Ok(value) => InspectDown::Queries { id, value },
                    Err(e) => {
                        tracing::warn!("Inspect queries failed: {e:#}");
                        InspectDown::Queries { id, value: vec![] }
                    },
                }
            },
            InspectUp::AnalyzeQuery { id, value } => {
                let result = self.analyze_query(client_id, value).await;
                InspectDown::AnalyzeQuery {
                    id,
                    value: result.unwrap_or_else(|e| AnalyzeQueryResult {
                        warnings: vec![format!("Analysis failed: {e:#}")],
                        after_permissions: None,
                        start: 0,
                        end: 0,
                        synced_row_count: 0,
                        synced_rows: None,
                        vended_row_count: None,
                        vended_rows: None,
                        join_plans: None,
                    }),
                }
            },
        }
    }

    fn metrics_digests(&self) -> JsonValue {
        let materialization = self
            .query_metrics
            .global_digest(QueryMetric::MaterializationServer)
            .ok();
        let update = self
            .query_metrics
            .global_digest(QueryMetric::UpdateServer)
            .ok();
        serde_json::json!({
            QueryMetric::MaterializationServer.as_str(): materialization,
            QueryMetric::UpdateServer.as_str(): update,
        })
    }

    /// Per-query CVR rows joined with server metrics and, when a pipeline
    /// is running, the transformed AST.
    fn query_rows(&self, client_id: Option<&ClientId>) -> anyhow::Result<Vec<InspectQueryRow>> {
        let records = {
            let desired: Option<std::collections::BTreeSet<QueryHash>> =
                client_id.map(|id| self.cvr.desired_queries(id));
            let mut out = Vec::new();
            for (hash, query) in &self.cvr.queries {
                if let Some(desired) = &desired {
                    if !desired.contains(hash) {
                        continue;
                    }
                }
                let row_count = self
                    .cvr
                    .rows
                    .values()
                    .filter(|row| row.ref_counts.get(hash).copied().unwrap_or(0) > 0)
                    .count() as u64;
                out.push((hash.clone(), query.clone(), row_count));
            }
            out
        };
        let mut rows = Vec::with_capacity(records.len());
        for (hash, query, row_count) in records {
            let transformed_ast = query
                .transformation_hash
                .as_ref()
                .and_then(|th| self.driver.ast(th))
                .map(|ast| ast.to_builder_string());
            let (materialization, update) = match &query.transformation_hash {
                Some(th) => (
                    serde_json::to_value(
                        self.query_metrics
                            .series_digest(QueryMetric::MaterializationServer, th.as_str()),
                    )
                    .ok(),
                    serde_json::to_value(
                        self.query_metrics
                            .series_digest(QueryMetric::UpdateServer, th.as_str()),
                    )
                    .ok(),
                ),
                None => (None, None),
            };
            rows.push(InspectQueryRow {
                query_hash: hash,
                transformation_hash: query.transformation_hash.clone(),
                gotten: query.gotten,
                ttl_ms: query.ttl_ms,
                expires_at_ms: query.expires_at,
                row_count,
                transformed_ast,
                materialization_metrics: materialization,
                update_metrics: update,
            });
        }
        Ok(rows)
    }

    /// Run a query against a throwaway snapshot and report statistics. For
    /// named queries the transformer resolves the AST first; permissions
    /// are loaded and applied eagerly so the reported AST is the one a
    /// pipeline would actually run.
    async fn analyze_query(
        &mut self,
        client_id: &ClientId,
        request: AnalyzeQueryRequest,
    ) -> anyhow::Result<AnalyzeQueryResult> {
        let mut warnings = Vec::new();
        let base_ast: Ast = match &request.query {
            QuerySpec::Ast { ast } => ast.clone(),
            QuerySpec::Custom { name, args } => {
                let url = self
                    .user_query_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("No custom-query endpoint configured"))?;
                let record = CustomQueryRecord {
                    id: request.query.query_hash(),
                    name: name.clone(),
                    args: args.clone(),
                };
                let options = TransformOptions {
                    auth_data: self.auth_data_for(client_id).cloned(),
                    ..Default::default()
                };
                let outcomes = self
                    .transformer()
                    .transform(&options, &[record], &url)
                    .await?;
                match outcomes.into_iter().next() {
                    Some(TransformOutcome::Transformed { ast, .. }) => ast,
                    Some(TransformOutcome::Error { message, .. }) => {
                        anyhow::bail!("Resolver rejected query: {message}")
                    },
                    None => anyhow::bail!("Resolver returned no result"),
                }
            },
        };
        let auth_data = self.auth_data_for(client_id).cloned();
        let (rewritten, mut permission_warnings) = apply_permissions(
            base_ast,
            self.transformer().permissions(),
            auth_data.as_ref(),
        );
        warnings.append(&mut permission_warnings);
        let after_permissions = rewritten.to_builder_string();

        // Fresh short-lived snapshot; the live driver and CVR are never
        // touched.
        let snapshot = self.snapshotter().current()?;
        let join_plans = if request.options.join_plans {
            Some(serde_json::json!(hydration_plan(&rewritten, &snapshot)?))
        } else {
            None
        };
        let mut scratch = PipelineDriver::new();
        scratch.init(snapshot)?;
        let transformation_hash = rewritten.transformation_hash();
        let start = now_ms();
        let changes = scratch.add_query(
            &transformation_hash,
            &QueryHash::from(transformation_hash.as_str()),
            &rewritten,
            &WallClockTimer::new(),
        )?;
        let end = now_ms();

        let mut synced_row_count = 0u64;
        let mut rows_by_table: BTreeMap<String, Vec<RowData>> = BTreeMap::new();
        for change in &changes {
            if let RowChange::Add { key, row } = change {
                synced_row_count += 1;
                if request.options.synced_rows || request.options.vended_rows {
                    rows_by_table
                        .entry(key.table.clone())
                        .or_default()
                        .push(row.clone());
                }
            }
        }
        let rows_json = (!rows_by_table.is_empty())
            .then(|| serde_json::to_value(&rows_by_table))
            .transpose()?;

        Ok(AnalyzeQueryResult {
            warnings,
            after_permissions: Some(after_permissions),
            start,
            end,
            synced_row_count,
            synced_rows: request.options.synced_rows.then(|| rows_json.clone()).flatten(),
            vended_row_count: request.options.vended_rows.then_some(synced_row_count),
            vended_rows: request.options.vended_rows.then_some(rows_json).flatten(),
            join_plans,
        })
    }
}
