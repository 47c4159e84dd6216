use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    path::PathBuf,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use anyhow::Context as _;
use common::{
    knobs::{
        CLIENT_TTL,
        DEFAULT_QUERY_TTL,
    },
    query::Ast,
    types::{
        ClientGroupId,
        ClientId,
        CvrVersion,
        QueryHash,
        ReplicaVersion,
        TransformationHash,
        WsId,
    },
    value::{
        RowData,
        RowKey,
    },
};
use cvr::{
    Cvr,
    CvrConflict,
    CvrStore,
    CvrUpdater,
};
use errors::ErrorMetadata;
use pipeline::{
    AdvanceTimer,
    PipelineChange,
    PipelineDriver,
    ResetPipelinesSignal,
    RowChange,
    WallClockTimer,
};
use query_metrics::{
    QueryMetric,
    QueryMetricStore,
};
use replica::{
    AdvanceResult,
    ChangeLogEntry,
    Snapshotter,
};
use serde_json::Value as JsonValue;
use sync_types::{
    ChangeDesiredQueriesBody,
    ClientMessage,
    ConnectParams,
    DesiredQueryPatchOp,
    InitConnectionBody,
    MutationResponse,
    PushBody,
    QuerySpec,
    ServerMessage,
    TransformErrorBody,
};
use tokio::sync::{
    mpsc,
    oneshot,
    watch,
};
use transform::{
    CustomQueryRecord,
    TransformOptions,
    TransformOutcome,
    Transformer,
    TransformerError,
};

use crate::{
    client::{
        ClientHandle,
        ClientReceiver,
        CloseSignal,
    },
    metrics,
    pokes::{
        build_client_poke,
        PokeDeltas,
    },
};

#[derive(Clone, Debug)]
pub struct ViewSyncerConfig {
    pub replica_path: PathBuf,
    pub build_version: String,
    pub dev_mode: bool,
}

/// Requests from the transport shell and the replicator/pusher
/// collaborators. Everything the syncer does is driven through this queue
/// (or the version watch), so its state needs no locks.
pub enum SyncerRequest {
    Connect {
        params: ConnectParams,
        init: InitConnectionBody,
        auth_data: Option<JsonValue>,
        reply: oneshot::Sender<anyhow::Result<ClientReceiver>>,
    },
    Message {
        client_id: ClientId,
        message: ClientMessage,
    },
    Disconnect {
        client_id: ClientId,
        ws_id: Option<WsId>,
    },
    /// Authoritative mutation results reported by the push processor.
    MutationResults { results: Vec<MutationResponse> },
    Stop,
}

#[derive(Clone)]
pub struct ViewSyncerHandle {
    tx: mpsc::UnboundedSender<SyncerRequest>,
}

impl ViewSyncerHandle {
    pub async fn connect(
        &self,
        params: ConnectParams,
        init: InitConnectionBody,
        auth_data: Option<JsonValue>,
    ) -> anyhow::Result<ClientReceiver> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(SyncerRequest::Connect {
                params,
                init,
                auth_data,
                reply,
            })
            .map_err(|_| anyhow::anyhow!("View syncer stopped"))?;
        response.await.context("View syncer dropped connect reply")?
    }

    pub fn message(&self, client_id: ClientId, message: ClientMessage) -> anyhow::Result<()> {
        self.tx
            .send(SyncerRequest::Message { client_id, message })
            .map_err(|_| anyhow::anyhow!("View syncer stopped"))
    }

    pub fn disconnect(&self, client_id: ClientId, ws_id: Option<WsId>) {
        let _ = self.tx.send(SyncerRequest::Disconnect { client_id, ws_id });
    }

    pub fn report_mutation_results(&self, results: Vec<MutationResponse>) {
        let _ = self.tx.send(SyncerRequest::MutationResults { results });
    }

    pub fn stop(&self) {
        let _ = self.tx.send(SyncerRequest::Stop);
    }
}

/// Per-client-group coordinator. Owns the CVR, the pipelines, the replica
/// snapshot, and the connected client handlers; see the crate docs for the
/// threading model.
pub struct ViewSyncer {
    client_group_id: ClientGroupId,
    config: ViewSyncerConfig,
    store: Arc<CvrStore>,
    snapshotter: Snapshotter,
    transformer: Arc<Transformer>,
    pub(crate) query_metrics: Arc<QueryMetricStore>,

    pub(crate) driver: PipelineDriver,
    pub(crate) cvr: Cvr,
    clients: BTreeMap<ClientId, ClientHandle>,
    auth_data: BTreeMap<ClientId, JsonValue>,
    /// Transformed ASTs cached by transformation hash, for rebuilds after a
    /// pipeline reset. Lost on restart; queries re-transform on reconnect.
    transformed_asts: BTreeMap<TransformationHash, Ast>,
    pub(crate) user_query_url: Option<String>,
    pending_mutation_results: BTreeMap<ClientId, Vec<MutationResponse>>,
    /// Forwarding channel to the push processor collaborator; `None` fails
    /// pushes.
    push_forward: Option<mpsc::UnboundedSender<(ClientGroupId, PushBody)>>,
    poke_counter: u64,

    rx: Option<mpsc::UnboundedReceiver<SyncerRequest>>,
    version_rx: Option<watch::Receiver<u64>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ViewSyncer {
    pub fn new(
        client_group_id: ClientGroupId,
        config: ViewSyncerConfig,
        store: Arc<CvrStore>,
        transformer: Arc<Transformer>,
        version_rx: watch::Receiver<u64>,
        push_forward: Option<mpsc::UnboundedSender<(ClientGroupId, PushBody)>>,
    ) -> (Self, ViewSyncerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshotter = Snapshotter::new(&config.replica_path);
        let syncer = Self {
            cvr: Cvr::new(client_group_id.clone()),
            client_group_id,
            config,
            store,
            snapshotter,
            transformer,
            query_metrics: Arc::new(QueryMetricStore::new()),
            driver: PipelineDriver::new(),
            clients: BTreeMap::new(),
            auth_data: BTreeMap::new(),
            transformed_asts: BTreeMap::new(),
            user_query_url: None,
            pending_mutation_results: BTreeMap::new(),
            push_forward,
            poke_counter: 0,
            rx: Some(rx),
            version_rx: Some(version_rx),
        };
        (syncer, ViewSyncerHandle { tx })
    }

    pub fn client_group_id(&self) -> &ClientGroupId {
        &self.client_group_id
    }

    pub(crate) fn config(&self) -> &ViewSyncerConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn set_dev_mode(&mut self, dev_mode: bool) {
        self.config.dev_mode = dev_mode;
    }

    pub(crate) fn snapshotter(&self) -> &Snapshotter {
        &self.snapshotter
    }

    pub(crate) fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub(crate) fn auth_data_for(&self, client_id: &ClientId) -> Option<&JsonValue> {
        self.auth_data.get(client_id)
    }

    /// Bind to the replica and adopt the persisted CVR. Queries load
    /// untransformed: pipelines rebuild as clients reconnect, and the row
    /// diff against the persisted CVR keeps the resulting pokes minimal.
    pub fn initialize(&mut self) -> anyhow::Result<()> {
        self.cvr = self.store.load(&self.client_group_id)?;
        let snapshot = self.snapshotter.current()?;
        anyhow::ensure!(
            self.cvr.version.major <= snapshot.version().0,
            "CVR at {} is ahead of replica at {}",
            self.cvr.version,
            snapshot.version()
        );
        self.driver.init(snapshot)?;
        if self.cvr.queries.values().any(|q| q.transformation_hash.is_some() || q.gotten) {
            let mut updater = CvrStore::updater(&self.cvr);
            let hashes: Vec<QueryHash> = self.cvr.queries.keys().cloned().collect();
            for hash in &hashes {
                updater.clear_query_state(hash);
            }
            self.cvr = self.store.flush(updater)?;
        }
        Ok(())
    }

    /// Run the coordinator until `Stop`, the handle closing, or a fatal
    /// error.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.initialize()?;
        let mut rx = self.rx.take().context("run called twice")?;
        let mut version_rx = self.version_rx.take().context("run called twice")?;
        let mut ttl_ticker = tokio::time::interval(Duration::from_secs(30));
        ttl_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                request = rx.recv() => {
                    match request {
                        None | Some(SyncerRequest::Stop) => break,
                        Some(request) => {
                            if let Err(mut e) = self.handle_request(request).await {
                                errors::report_error(&mut e);
                            }
                        },
                    }
                },
                changed = version_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.version_ready().await?;
                },
                _ = ttl_ticker.tick() => {
                    if let Err(mut e) = self.expire_tick() {
                        errors::report_error(&mut e);
                    }
                },
            }
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, mut handle) in std::mem::take(&mut self.clients) {
            handle.close(CloseSignal::ShuttingDown);
        }
        metrics::log_connected_clients(0);
    }

    async fn handle_request(&mut self, request: SyncerRequest) -> anyhow::Result<()> {
        match request {
            SyncerRequest::Connect {
                params,
                init,
                auth_data,
                reply,
            } => {
                let result = self.init_connection(params, init, auth_data).await;
                let _ = reply.send(result);
            },
            SyncerRequest::Message { client_id, message } => {
                let timer = metrics::handle_message_timer(&message);
                self.handle_message(client_id, message).await?;
                timer.finish();
            },
            SyncerRequest::Disconnect { client_id, ws_id } => {
                self.handle_disconnect(client_id, ws_id)?;
            },
            SyncerRequest::MutationResults { results } => {
                self.handle_mutation_results(results)?;
            },
            SyncerRequest::Stop => unreachable!("Stop handled by the run loop"),
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        client_id: ClientId,
        message: ClientMessage,
    ) -> anyhow::Result<()> {
        match message {
            ClientMessage::Ping => {
                self.send_to(&client_id, ServerMessage::Pong);
            },
            ClientMessage::InitConnection(init) => {
                // Late initConnection after a header-cap fallback: the
                // connection itself is already registered.
                self.apply_init_payload(&client_id, init).await?;
            },
            ClientMessage::ChangeDesiredQueries(ChangeDesiredQueriesBody {
                desired_queries_patch,
            }) => {
                self.change_desired_queries(&client_id, &desired_queries_patch)
                    .await?;
            },
            ClientMessage::DeleteClients(body) => {
                self.delete_clients(&client_id, body.client_ids)?;
            },
            ClientMessage::Push(push) => match self.push_forward.clone() {
                Some(forward) => {
                    let _ = forward.send((self.client_group_id.clone(), push));
                    self.send_to(
                        &client_id,
                        ServerMessage::PushResponse(serde_json::json!({})),
                    );
                },
                None => {
                    let body = sync_types::ErrorBody::new(
                        sync_types::ErrorKind::PushFailed,
                        "No push processor configured",
                    );
                    self.send_to(&client_id, ServerMessage::Error(body));
                },
            },
            ClientMessage::Pull(_) => {
                self.send_to(
                    &client_id,
                    ServerMessage::PullResponse(serde_json::json!({})),
                );
            },
            ClientMessage::AckMutationResponses { ack_ids } => {
                for id in ack_ids {
                    if let Some(pending) = self.pending_mutation_results.get_mut(&id.client_id) {
                        pending.retain(|r| r.id != id);
                    }
                }
            },
            ClientMessage::Inspect(op) => {
                let response = self.handle_inspect(&client_id, op).await;
                self.send_to(&client_id, ServerMessage::InspectResponse(response));
            },
        }
        Ok(())
    }

    fn send_to(&mut self, client_id: &ClientId, message: ServerMessage) {
        let Some(handle) = self.clients.get(client_id) else {
            return;
        };
        if let Err(signal) = handle.send(message) {
            self.drop_client(client_id.clone(), signal);
        }
    }

    fn drop_client(&mut self, client_id: ClientId, signal: CloseSignal) {
        if let Some(mut handle) = self.clients.remove(&client_id) {
            tracing::info!("Dropping client {client_id}: {:?}", signal);
            handle.close(signal);
        }
        metrics::log_connected_clients(self.clients.len());
    }

    pub(crate) async fn init_connection(
        &mut self,
        params: ConnectParams,
        init: InitConnectionBody,
        auth_data: Option<JsonValue>,
    ) -> anyhow::Result<ClientReceiver> {
        // Validate the base cookie against the CVR before touching state.
        let base_cookie = match &params.base_cookie {
            None => None,
            Some(raw) => {
                let cookie: CvrVersion = raw.parse().map_err(|_| {
                    ErrorMetadata::bad_request(
                        "InvalidConnectionRequestBaseCookie",
                        format!("Unparseable baseCookie {raw:?}"),
                    )
                })?;
                if cookie != self.cvr.version {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "InvalidConnectionRequestBaseCookie",
                        format!(
                            "baseCookie {cookie} does not match the server state {}",
                            self.cvr.version
                        ),
                    ));
                }
                Some(cookie)
            },
        };
        match self.cvr.clients.get(&params.client_id) {
            Some(record) => {
                if params.lmid > record.lmid {
                    anyhow::bail!(ErrorMetadata::bad_request(
                        "InvalidConnectionRequestLastMutationID",
                        format!(
                            "Client {} claims lmid {} but the server has {}",
                            params.client_id, params.lmid, record.lmid
                        ),
                    ));
                }
            },
            None => {
                if params.lmid > 0 {
                    anyhow::bail!(ErrorMetadata::not_found(
                        "ClientNotFound",
                        format!(
                            "Client {} has mutations but no server record",
                            params.client_id
                        ),
                    ));
                }
            },
        }
        if let (Some(stored), Some(offered)) = (&self.cvr.client_schema, &init.client_schema) {
            if stored != offered {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "SchemaVersionNotSupported",
                    "Client schema does not match the schema this view is synced with",
                ));
            }
        }

        // A reconnect replaces any stale handler for the same client.
        self.drop_client(params.client_id.clone(), CloseSignal::ShuttingDown);
        let (handle, receiver) =
            ClientHandle::new(params.client_id.clone(), params.ws_id.clone(), base_cookie);
        let connected = ServerMessage::Connected(sync_types::ConnectedBody {
            ws_id: params
                .ws_id
                .as_ref()
                .map(|w| w.as_str().to_owned())
                .unwrap_or_default(),
            timestamp: Some(now_ms()),
        });
        handle
            .send(connected)
            .ok()
            .context("Fresh client queue rejected the connected message")?;
        self.clients.insert(params.client_id.clone(), handle);
        metrics::log_connected_clients(self.clients.len());
        if let Some(auth) = auth_data {
            self.auth_data.insert(params.client_id.clone(), auth);
        }

        self.apply_init_payload(&params.client_id, init).await?;
        Ok(receiver)
    }

    async fn apply_init_payload(
        &mut self,
        client_id: &ClientId,
        init: InitConnectionBody,
    ) -> anyhow::Result<()> {
        if let Some(url) = init.user_query_url {
            self.user_query_url = Some(url);
        }
        if let Some(schema) = &init.client_schema {
            if self.cvr.client_schema.is_none() {
                let mut updater = CvrStore::updater(&self.cvr);
                updater.set_client_schema(schema.clone());
                self.cvr = self.flush_conflict_checked(updater)?;
            }
        }
        // Connection liveness: the client entry stops aging while connected.
        {
            let mut updater = CvrStore::updater(&self.cvr);
            updater.ensure_client(client_id);
            updater.set_client_expiry(client_id, None);
            if updater.has_changes() {
                self.cvr = self.flush_conflict_checked(updater)?;
            }
        }
        self.change_desired_queries(client_id, &init.desired_queries_patch)
            .await
    }

    /// Diff a desired-queries patch into the CVR, transform newly added
    /// queries, attach/detach pipelines, and poke affected clients.
    pub(crate) async fn change_desired_queries(
        &mut self,
        client_id: &ClientId,
        patch: &[DesiredQueryPatchOp],
    ) -> anyhow::Result<()> {
        let mut updater = CvrStore::updater(&self.cvr);
        let diff =
            updater.set_desired_queries(client_id, patch, DEFAULT_QUERY_TTL.as_millis() as u64);
        if diff.is_empty() {
            // Idempotent reapplication of an already-applied patch: no
            // version bump, no poke.
            return Ok(());
        }
        let mut deltas = PokeDeltas::default();
        deltas
            .desired_acks
            .insert(client_id.clone(), patch.to_vec());

        let mut transform_errors: Vec<TransformErrorBody> = Vec::new();
        for (hash, spec) in &diff.added {
            match self.transform_spec(client_id, hash, spec).await {
                Ok((ast, transformation_hash)) => {
                    self.attach_query(&mut updater, &mut deltas, hash, &ast, &transformation_hash)?;
                },
                Err(TransformFailure::PerQuery(body)) => {
                    metrics::log_transform_error();
                    updater.remove_query(hash);
                    transform_errors.push(body);
                },
                Err(TransformFailure::Fatal(e)) => return Err(e),
            }
        }
        for hash in &diff.removed {
            // Visibility for this client changes even though refcounts do
            // not; mark every row the query holds so the diff notices.
            for (key, row) in updater.cvr().rows.iter() {
                if row.ref_counts.get(hash).copied().unwrap_or(0) > 0 {
                    deltas.rows.entry(key.clone()).or_insert(None);
                }
            }
        }
        updater.age_undesired_queries(now_ms());

        if updater.has_changes() || !deltas.is_empty() {
            updater.advance_minor();
            self.flush_and_poke(updater, deltas)?;
        }
        for body in transform_errors {
            self.send_to(client_id, ServerMessage::TransformError(body));
        }
        metrics::log_query_set_size(self.cvr.queries.len());
        Ok(())
    }

    async fn transform_spec(
        &mut self,
        client_id: &ClientId,
        hash: &QueryHash,
        spec: &QuerySpec,
    ) -> Result<(Ast, TransformationHash), TransformFailure> {
        let auth_data = self.auth_data.get(client_id).cloned();
        match spec {
            QuerySpec::Ast { ast } => {
                let (ast, transformation_hash, _warnings) = self
                    .transformer
                    .transform_ast(ast.clone(), auth_data.as_ref());
                Ok((ast, transformation_hash))
            },
            QuerySpec::Custom { name, args } => {
                let url = self.user_query_url.clone().ok_or_else(|| {
                    TransformFailure::PerQuery(TransformErrorBody {
                        query_hashes: vec![hash.clone()],
                        error: sync_types::MutationErrorKind::Zero,
                        message: "No custom-query endpoint configured".into(),
                        details: None,
                    })
                })?;
                let records = vec![CustomQueryRecord {
                    id: hash.clone(),
                    name: name.clone(),
                    args: args.clone(),
                }];
                let options = TransformOptions {
                    auth_data,
                    ..Default::default()
                };
                let outcomes = self
                    .transformer
                    .transform(&options, &records, &url)
                    .await
                    .map_err(|e| match e {
                        TransformerError::Unreachable(msg) => {
                            TransformFailure::PerQuery(TransformErrorBody {
                                query_hashes: vec![hash.clone()],
                                error: sync_types::MutationErrorKind::Http,
                                message: format!("Transformer unreachable: {msg}"),
                                details: None,
                            })
                        },
                        other => TransformFailure::Fatal(other.into()),
                    })?;
                match outcomes.into_iter().next() {
                    Some(TransformOutcome::Transformed {
                        ast,
                        transformation_hash,
                        ..
                    }) => Ok((ast, transformation_hash)),
                    Some(TransformOutcome::Error {
                        error,
                        message,
                        details,
                        ..
                    }) => Err(TransformFailure::PerQuery(TransformErrorBody {
                        query_hashes: vec![hash.clone()],
                        error,
                        message,
                        details,
                    })),
                    None => Err(TransformFailure::Fatal(
                        TransformerError::NoResult(hash.clone()).into(),
                    )),
                }
            },
        }
    }

    /// Attach one transformed query: start or join its pipeline, seed the
    /// CVR rows, and mark it gotten.
    fn attach_query(
        &mut self,
        updater: &mut CvrUpdater,
        deltas: &mut PokeDeltas,
        hash: &QueryHash,
        ast: &Ast,
        transformation_hash: &TransformationHash,
    ) -> anyhow::Result<()> {
        updater.set_transformation(hash, transformation_hash);
        self.transformed_asts
            .insert(transformation_hash.clone(), ast.clone());
        let major = self
            .driver
            .version()
            .context("Driver has no snapshot")?;

        let was_running = self.driver.has_pipeline(transformation_hash);
        let timer = WallClockTimer::new();
        let hydrated = self
            .driver
            .add_query(transformation_hash, hash, ast, &timer)?;
        let rows: Vec<(RowKey, RowData)> = if was_running {
            self.driver.current_rows(transformation_hash)?
        } else {
            self.query_metrics.record(
                QueryMetric::MaterializationServer,
                transformation_hash.as_str(),
                timer.total_elapsed(),
            );
            hydrated
                .into_iter()
                .filter_map(|change| match change {
                    RowChange::Add { key, row } => Some((key, row)),
                    _ => None,
                })
                .collect()
        };
        reconcile_query_rows(updater, deltas, hash, rows, major);
        updater.mark_gotten(hash);
        deltas.got_queries.push(hash.clone());
        Ok(())
    }

    /// One replica version bump: advance pipelines, translate row diffs
    /// into per-client pokes through the CVR, flush, stream. Loops until
    /// the replica stops moving.
    pub async fn version_ready(&mut self) -> anyhow::Result<()> {
        loop {
            let Some(prev) = self.driver.snapshot() else {
                return Ok(());
            };
            match self.snapshotter.advance(prev)? {
                AdvanceResult::SameVersion => return Ok(()),
                AdvanceResult::Advanced {
                    snapshot,
                    from_version,
                    to_version,
                    changes,
                } => {
                    let timer = metrics::advance_cycle_timer();
                    match self.apply_advancement(snapshot, from_version, to_version, changes) {
                        Ok(()) => {
                            timer.finish();
                        },
                        // Reset signals and flush conflicts share a recovery
                        // path: tear down, rebuild from the reloaded CVR,
                        // and let the rebuild's flush be the single retry.
                        Err(e)
                            if e.downcast_ref::<ResetPipelinesSignal>().is_some()
                                || e.downcast_ref::<CvrConflict>().is_some() =>
                        {
                            metrics::log_pipeline_reset();
                            self.driver.reset(&format!("{e}"));
                            self.rebuild_pipelines()?;
                        },
                        Err(e) => return Err(e),
                    }
                },
            }
        }
    }

    fn apply_advancement(
        &mut self,
        snapshot: replica::Snapshot,
        from_version: ReplicaVersion,
        to_version: ReplicaVersion,
        changes: replica::ChangeLog,
    ) -> anyhow::Result<()> {
        let timer = WallClockTimer::new();
        let mut advancement = self
            .driver
            .advance(snapshot, from_version, changes, &timer)?;
        let mut updater = CvrStore::updater(&self.cvr);
        let mut deltas = PokeDeltas::default();
        let mut touched: BTreeSet<TransformationHash> = BTreeSet::new();
        for item in advancement.by_ref() {
            let change = item?;
            touched.insert(change.transformation_hash.clone());
            apply_pipeline_change(&mut updater, &mut deltas, to_version, change);
        }
        let lmid_entries = advancement.into_lmid_entries();
        self.apply_lmid_entries(&mut updater, &mut deltas, lmid_entries)?;

        let elapsed = timer.total_elapsed();
        for transformation_hash in &touched {
            self.query_metrics.record(
                QueryMetric::UpdateServer,
                transformation_hash.as_str(),
                elapsed,
            );
        }
        updater.advance_major(to_version)?;
        self.flush_and_poke(updater, deltas)
    }

    fn apply_lmid_entries(
        &mut self,
        updater: &mut CvrUpdater,
        deltas: &mut PokeDeltas,
        entries: Vec<ChangeLogEntry>,
    ) -> anyhow::Result<()> {
        for entry in entries {
            let Some(row) = entry.new_row else {
                continue;
            };
            let group = row
                .get("clientGroupID")
                .and_then(|v| match v {
                    common::value::SqlValue::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .unwrap_or_default();
            if group != self.client_group_id.as_str() {
                continue;
            }
            let Some(common::value::SqlValue::Text(client)) = row.get("clientID") else {
                continue;
            };
            let Some(common::value::SqlValue::Integer(lmid)) = row.get("lastMutationID") else {
                continue;
            };
            let client_id = ClientId::from(client.as_str());
            let lmid = *lmid as u64;
            updater.set_lmid(&client_id, lmid);
            deltas.lmid_changes.insert(client_id.clone(), lmid);
            // Outstanding error results must reach the client no later than
            // the lmid that passes them.
            if let Some(pending) = self.pending_mutation_results.get_mut(&client_id) {
                let (deliver, keep): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|r| r.id.id <= lmid);
                *pending = keep;
                if !deliver.is_empty() {
                    deltas
                        .mutation_results
                        .entry(client_id)
                        .or_default()
                        .extend(deliver);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn handle_mutation_results(&mut self, results: Vec<MutationResponse>) -> anyhow::Result<()> {
        let mut deltas = PokeDeltas::default();
        for result in results {
            let client_id = result.id.client_id.clone();
            let lmid = self
                .cvr
                .clients
                .get(&client_id)
                .map(|c| c.lmid)
                .unwrap_or(0);
            if result.id.id <= lmid {
                // The lmid already passed this mutation; deliver now.
                deltas
                    .mutation_results
                    .entry(client_id)
                    .or_default()
                    .push(result);
            } else {
                self.pending_mutation_results
                    .entry(client_id)
                    .or_default()
                    .push(result);
            }
        }
        if !deltas.is_empty() {
            let mut updater = CvrStore::updater(&self.cvr);
            updater.advance_minor();
            self.flush_and_poke(updater, deltas)?;
        }
        Ok(())
    }

    /// Rebuild every pipeline whose transformed AST is still cached, after
    /// a reset. The CVR row diff produced by reconciliation keeps client
    /// pokes minimal.
    fn rebuild_pipelines(&mut self) -> anyhow::Result<()> {
        let snapshot = self.snapshotter.current()?;
        let to_version = snapshot.version();
        self.driver.init(snapshot)?;
        let mut updater = CvrStore::updater(&self.cvr);
        let mut deltas = PokeDeltas::default();

        let queries: Vec<(QueryHash, TransformationHash)> = self
            .cvr
            .queries
            .iter()
            .filter_map(|(hash, q)| {
                q.transformation_hash
                    .as_ref()
                    .map(|th| (hash.clone(), th.clone()))
            })
            .collect();
        for (hash, transformation_hash) in queries {
            let Some(ast) = self.transformed_asts.get(&transformation_hash).cloned() else {
                // No cached AST (instance restart): the query re-transforms
                // when its client reconnects.
                updater.clear_query_state(&hash);
                continue;
            };
            let timer = WallClockTimer::new();
            let hydrated =
                self.driver
                    .add_query(&transformation_hash, &hash, &ast, &timer)?;
            let rows: Vec<(RowKey, RowData)> = if hydrated.is_empty() {
                self.driver.current_rows(&transformation_hash)?
            } else {
                self.query_metrics.record(
                    QueryMetric::MaterializationServer,
                    transformation_hash.as_str(),
                    timer.total_elapsed(),
                );
                hydrated
                    .into_iter()
                    .filter_map(|change| match change {
                        RowChange::Add { key, row } => Some((key, row)),
                        _ => None,
                    })
                    .collect()
            };
            reconcile_query_rows(&mut updater, &mut deltas, &hash, rows, to_version);
        }
        if to_version.0 > updater.version().major {
            updater.advance_major(to_version)?;
        } else {
            updater.advance_minor();
        }
        self.flush_and_poke(updater, deltas)
    }

    fn expire_tick(&mut self) -> anyhow::Result<()> {
        let mut updater = CvrStore::updater(&self.cvr);
        let mut deltas = PokeDeltas::default();
        let removed = updater.expire(now_ms());
        if removed.is_empty() && !updater.has_changes() {
            return Ok(());
        }
        for hash in &removed {
            for (key, row) in self.cvr.rows.iter() {
                if row.ref_counts.get(hash).copied().unwrap_or(0) > 0 {
                    deltas.rows.entry(key.clone()).or_insert(None);
                }
            }
            if let Some(transformation_hash) = self.driver.remove_query(hash) {
                self.transformed_asts.remove(&transformation_hash);
                self.query_metrics
                    .remove_series(transformation_hash.as_str());
            }
        }
        updater.advance_minor();
        self.flush_and_poke(updater, deltas)
    }

    fn handle_disconnect(
        &mut self,
        client_id: ClientId,
        _ws_id: Option<WsId>,
    ) -> anyhow::Result<()> {
        self.drop_client(client_id.clone(), CloseSignal::ShuttingDown);
        self.auth_data.remove(&client_id);
        if self.cvr.clients.contains_key(&client_id) {
            let mut updater = CvrStore::updater(&self.cvr);
            updater.set_client_expiry(
                &client_id,
                Some(now_ms().saturating_add(CLIENT_TTL.as_millis() as u64)),
            );
            if updater.has_changes() {
                self.cvr = self.flush_conflict_checked(updater)?;
            }
        }
        Ok(())
    }

    fn delete_clients(
        &mut self,
        requester: &ClientId,
        client_ids: Vec<ClientId>,
    ) -> anyhow::Result<()> {
        let mut updater = CvrStore::updater(&self.cvr);
        for client_id in client_ids {
            if &client_id == requester {
                continue;
            }
            self.drop_client(client_id.clone(), CloseSignal::ShuttingDown);
            updater.remove_client(&client_id);
            self.pending_mutation_results.remove(&client_id);
        }
        updater.age_undesired_queries(now_ms());
        if updater.has_changes() {
            updater.advance_minor();
            self.flush_and_poke(updater, PokeDeltas::default())?;
        }
        Ok(())
    }

    /// Flush the updater (optimistic retry once) and stream per-client
    /// pokes for the committed transition.
    fn flush_and_poke(&mut self, updater: CvrUpdater, deltas: PokeDeltas) -> anyhow::Result<()> {
        let new_version = updater.version();
        self.poke_counter += 1;
        let poke_id = format!("{}:{}", self.client_group_id, self.poke_counter);

        // Build pokes against the pre-flush CVR (prev) and the updater's
        // working copy (next) before the updater is consumed.
        let mut pokes: Vec<(ClientId, Vec<ServerMessage>)> = Vec::new();
        for (client_id, handle) in &self.clients {
            if let Some(messages) = build_client_poke(
                client_id,
                handle.last_cookie,
                new_version,
                &poke_id,
                &self.cvr,
                updater.cvr(),
                &deltas,
            ) {
                pokes.push((client_id.clone(), messages));
            }
        }

        self.cvr = self.flush_conflict_checked(updater)?;

        for (client_id, messages) in pokes {
            let mut failed = None;
            if let Some(handle) = self.clients.get_mut(&client_id) {
                for message in messages {
                    if let Err(signal) = handle.send(message) {
                        failed = Some(signal);
                        break;
                    }
                }
                if failed.is_none() {
                    handle.last_cookie = Some(new_version);
                    metrics::log_poke();
                }
            }
            if let Some(signal) = failed {
                // A slow consumer loses its poke and reconnects; the
                // pipeline never waits for it.
                self.drop_client(client_id, signal);
            }
        }
        Ok(())
    }

    /// Flush with the optimistic-conflict policy: reload and retry once; a
    /// second conflict is promoted to an internal error.
    fn flush_conflict_checked(&mut self, updater: CvrUpdater) -> anyhow::Result<Cvr> {
        match self.store.flush(updater) {
            Ok(cvr) => Ok(cvr),
            Err(e) if e.downcast_ref::<CvrConflict>().is_some() => {
                metrics::log_cvr_conflict(true);
                tracing::warn!("CVR conflict for {}; reloading", self.client_group_id);
                self.cvr = self.store.load(&self.client_group_id)?;
                Err(e.context(ErrorMetadata::conflict(
                    "CvrConflict",
                    "Concurrent CVR write detected; state reloaded",
                )))
            },
            Err(e) => Err(e),
        }
    }
}

enum TransformFailure {
    /// Affects only the query (and client) that triggered it.
    PerQuery(TransformErrorBody),
    Fatal(anyhow::Error),
}

fn apply_pipeline_change(
    updater: &mut CvrUpdater,
    deltas: &mut PokeDeltas,
    row_version: ReplicaVersion,
    change: PipelineChange,
) {
    match change.change {
        RowChange::Add { key, row } => {
            let columns: BTreeSet<String> = row.keys().cloned().collect();
            for query_id in &change.query_ids {
                updater.add_row(query_id, key.clone(), row_version, columns.clone());
            }
            deltas.rows.insert(key, Some(row));
        },
        RowChange::Update { key, row } => {
            let columns: BTreeSet<String> = row.keys().cloned().collect();
            updater.update_row(&key, row_version, columns);
            deltas.rows.insert(key, Some(row));
        },
        RowChange::Remove { key } => {
            for query_id in &change.query_ids {
                updater.drop_row(query_id, &key);
            }
            deltas.rows.insert(key, None);
        },
    }
}

/// Make the CVR's row set for one query equal the given target multiset,
/// recording the adjustments in the poke deltas.
fn reconcile_query_rows(
    updater: &mut CvrUpdater,
    deltas: &mut PokeDeltas,
    hash: &QueryHash,
    target_rows: Vec<(RowKey, RowData)>,
    row_version: ReplicaVersion,
) {
    let mut target: BTreeMap<RowKey, (i64, RowData)> = BTreeMap::new();
    for (key, row) in target_rows {
        let entry = target.entry(key).or_insert((0, row));
        entry.0 += 1;
    }
    let current: BTreeMap<RowKey, i64> = updater
        .cvr()
        .rows
        .iter()
        .filter_map(|(key, row)| {
            let count = row.ref_counts.get(hash).copied().unwrap_or(0);
            (count > 0).then(|| (key.clone(), count))
        })
        .collect();

    for (key, (count, row)) in &target {
        let columns: BTreeSet<String> = row.keys().cloned().collect();
        let have = current.get(key).copied().unwrap_or(0);
        for _ in have..*count {
            updater.add_row(hash, key.clone(), row_version, columns.clone());
        }
        if have > *count {
            for _ in *count..have {
                updater.drop_row(hash, key);
            }
        }
        deltas.rows.insert(key.clone(), Some(row.clone()));
    }
    for (key, have) in &current {
        if !target.contains_key(key) {
            for _ in 0..*have {
                updater.drop_row(hash, key);
            }
            deltas.rows.entry(key.clone()).or_insert(None);
        }
    }
}
