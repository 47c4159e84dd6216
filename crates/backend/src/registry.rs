use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use common::types::ClientGroupId;
use cvr::CvrStore;
use parking_lot::Mutex;
use replica::Snapshotter;
use sync::{
    ViewSyncer,
    ViewSyncerConfig,
    ViewSyncerHandle,
};
use tokio::sync::watch;
use transform::Transformer;

#[derive(Clone, Debug)]
pub struct SyncerRegistryConfig {
    pub replica_path: PathBuf,
    pub build_version: String,
    pub dev_mode: bool,
}

/// Maps client groups to their coordinators, spawning one task per group on
/// first connection. Separate groups run in parallel; each owns its own
/// replica snapshot and CVR.
pub struct SyncerRegistry {
    config: SyncerRegistryConfig,
    store: Arc<CvrStore>,
    transformer: Arc<Transformer>,
    version_rx: watch::Receiver<u64>,
    syncers: Mutex<BTreeMap<ClientGroupId, ViewSyncerHandle>>,
}

impl SyncerRegistry {
    pub fn new(
        config: SyncerRegistryConfig,
        store: Arc<CvrStore>,
        transformer: Arc<Transformer>,
        version_rx: watch::Receiver<u64>,
    ) -> Self {
        Self {
            config,
            store,
            transformer,
            version_rx,
            syncers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The handle for a client group's coordinator, spawning it on demand.
    pub fn handle_for(&self, client_group_id: &ClientGroupId) -> ViewSyncerHandle {
        let mut syncers = self.syncers.lock();
        if let Some(handle) = syncers.get(client_group_id) {
            return handle.clone();
        }
        let (syncer, handle) = ViewSyncer::new(
            client_group_id.clone(),
            ViewSyncerConfig {
                replica_path: self.config.replica_path.clone(),
                build_version: self.config.build_version.clone(),
                dev_mode: self.config.dev_mode,
            },
            self.store.clone(),
            self.transformer.clone(),
            self.version_rx.clone(),
            None,
        );
        let group = client_group_id.clone();
        tokio::spawn(async move {
            if let Err(e) = syncer.run().await {
                let mut e = e.context(format!("View syncer for {group} died"));
                errors::report_error(&mut e);
            }
        });
        syncers.insert(client_group_id.clone(), handle.clone());
        handle
    }

    pub fn shutdown(&self) {
        for (_, handle) in self.syncers.lock().iter() {
            handle.stop();
        }
    }
}

/// Stand-in for the replication ingest's version signal: polls the replica's
/// state table and publishes bumps on a watch channel. The real replicator
/// drives the same channel directly.
pub fn spawn_version_poller(
    replica_path: PathBuf,
    interval: Duration,
) -> watch::Receiver<u64> {
    let (tx, rx) = watch::channel(0u64);
    tokio::spawn(async move {
        let snapshotter = Snapshotter::new(&replica_path);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }
            let version = match snapshotter.current() {
                Ok(snapshot) => snapshot.version().0,
                Err(e) => {
                    tracing::warn!("Replica poll failed: {e:#}");
                    continue;
                },
            };
            tx.send_if_modified(|current| {
                if *current == version {
                    false
                } else {
                    *current = version;
                    true
                }
            });
        }
    });
    rx
}
