//! Live map of execution clusters, reconciled from the `cluster` collection.
//!
//! One writer (the descriptor watch) and many readers (every controller).
//! Readers take the mutex only long enough to clone an `Arc`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use metrics::counter;
use nimbus_core::{Event, EventType, Filter, Object, Version};
use nimbus_store::ObjectStore;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::ClientBuilder;
use crate::client::ClusterClient;
use crate::ClusterSpec;

/// Membership change broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum ClusterChange {
    /// A client was built or rebuilt; any previous client of that name is stopped.
    Added(Arc<ClusterClient>),
    Removed(String),
}

pub struct ClusterRegistry {
    builder: Arc<dyn ClientBuilder>,
    clients: Mutex<FxHashMap<String, Arc<ClusterClient>>>,
    changes: broadcast::Sender<ClusterChange>,
    root: CancellationToken,
}

impl ClusterRegistry {
    pub fn new(builder: Arc<dyn ClientBuilder>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { builder, clients: Mutex::new(FxHashMap::default()), changes, root: CancellationToken::new() }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, Arc<ClusterClient>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClusterClient>> {
        self.lock().get(name).cloned()
    }

    /// Snapshot of all live clients, ordered by name.
    pub fn clients(&self) -> Vec<Arc<ClusterClient>> {
        let mut out: Vec<_> = self.lock().values().cloned().collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterChange> {
        self.changes.subscribe()
    }

    /// Build (or rebuild) the client for `cluster`. A client already built
    /// from the same descriptor revision is reused.
    pub async fn upsert(&self, cluster: &Object<ClusterSpec>) -> Result<Arc<ClusterClient>> {
        let name = cluster.name();
        if name.is_empty() {
            return Err(anyhow!("cluster descriptor without a name"));
        }
        if let Some(cur) = self.get(name) {
            if cur.built_from(cluster.uid(), cluster.version()) {
                debug!(cluster = %name, "client already current");
                return Ok(cur);
            }
        }
        let client = self.builder.build(cluster).await?;
        let cc = Arc::new(ClusterClient::new(name, cluster.uid(), cluster.version(), client, &self.root));
        let prev = self.lock().insert(name.to_string(), cc.clone());
        if let Some(prev) = prev {
            prev.stop();
        }
        counter!("cluster_clients_built_total", 1u64);
        info!(cluster = %name, version = %cluster.version(), "cluster client registered");
        let _ = self.changes.send(ClusterChange::Added(cc.clone()));
        Ok(cc)
    }

    /// Stop and evict. Returns the stopped client, if any.
    pub fn remove(&self, name: &str) -> Option<Arc<ClusterClient>> {
        let prev = self.lock().remove(name)?;
        prev.stop();
        info!(cluster = %name, "cluster client removed");
        let _ = self.changes.send(ClusterChange::Removed(name.to_string()));
        Some(prev)
    }

    /// Build a client for every stored descriptor and evict clients whose
    /// descriptor is gone. Bad configs are logged and skipped. Returns how
    /// many clusters are live.
    pub async fn bootstrap(&self, store: &ObjectStore, db: &str) -> nimbus_core::Result<usize> {
        let descriptors = store.list_to_object::<ClusterSpec>(db, &Filter::new()).await?;
        let total = descriptors.len();
        for d in &descriptors {
            if let Err(e) = self.upsert(d).await {
                counter!("cluster_bootstrap_failures_total", 1u64);
                warn!(cluster = %d.name(), error = %format!("{:#}", e), "skipping cluster with unusable config");
            }
        }
        self.evict_missing(descriptors.iter().map(|d| d.name()));
        let live = self.len();
        info!(live, total, "cluster registry bootstrapped");
        Ok(live)
    }

    /// Evict every client whose descriptor no longer exists. Returns how many
    /// were removed.
    pub async fn prune(&self, store: &ObjectStore, db: &str) -> nimbus_core::Result<usize> {
        let descriptors = store.list_to_object::<ClusterSpec>(db, &Filter::new()).await?;
        Ok(self.evict_missing(descriptors.iter().map(|d| d.name())))
    }

    fn evict_missing<'a>(&self, names: impl Iterator<Item = &'a str>) -> usize {
        let live: FxHashSet<&str> = names.collect();
        let stale: Vec<String> = self.lock().keys().filter(|n| !live.contains(n.as_str())).cloned().collect();
        for name in &stale {
            counter!("cluster_clients_pruned_total", 1u64);
            debug!(cluster = %name, "descriptor gone");
            self.remove(name);
        }
        stale.len()
    }

    /// Bootstrap, then follow the descriptor collection until `ctx` is cancelled.
    pub async fn start(self: &Arc<Self>, ctx: &CancellationToken, store: ObjectStore, db: &str) -> nimbus_core::Result<JoinHandle<()>> {
        self.bootstrap(&store, db).await?;
        Ok(self.spawn_watch(ctx, store, db))
    }

    /// Follow descriptor writes. A failed feed is re-opened after a short
    /// pause; the snapshot pass resynchronizes, and clients whose descriptor
    /// was deleted while no feed was open are evicted. On cancellation every
    /// client is stopped.
    pub fn spawn_watch(self: &Arc<Self>, ctx: &CancellationToken, store: ObjectStore, db: &str) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let ctx = ctx.clone();
        let db = db.to_string();
        tokio::spawn(async move {
            loop {
                let mut feed = store.watch_typed::<ClusterSpec>(&ctx, &db, Version::UNSET, Filter::new());
                // a snapshot never reports deletions
                if let Err(e) = me.prune(&store, &db).await {
                    warn!(error = %e, "cluster prune failed");
                }
                while let Some(next) = feed.next().await {
                    match next {
                        Ok(ev) => me.handle(ev).await,
                        Err(e) => {
                            warn!(error = %e, "cluster descriptor feed failed; reopening");
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            me.shutdown();
            info!("cluster registry watch stopped");
        })
    }

    async fn handle(&self, ev: Event<Object<ClusterSpec>>) {
        match ev.event_type {
            EventType::Added | EventType::Modified => {
                if let Err(e) = self.upsert(&ev.object).await {
                    counter!("cluster_build_failures_total", 1u64);
                    warn!(cluster = %ev.object.name(), error = %format!("{:#}", e), "cluster client not rebuilt");
                }
            }
            EventType::Deleted => {
                self.remove(ev.object.name());
            }
        }
    }

    /// Stop every client and empty the map.
    pub fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<_> = self.lock().drain().collect();
        for (name, _) in drained {
            let _ = self.changes.send(ClusterChange::Removed(name));
        }
    }
}
