//! Nimbus bridge: wires resource-kind handlers to the store's change feed
//! (North) and to one watch per execution cluster (South). Carries no
//! kind-specific logic.

#![forbid(unsafe_code)]

pub mod controller;
pub mod handler;

use std::sync::Arc;

use anyhow::{Context, Result};
use nimbus_kubehub::ClusterRegistry;
use nimbus_store::ObjectStore;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use controller::{BackendController, RunSummary};
pub use handler::{ClientInjectable, Handler, NorthHandler, SouthHandler};

/// A controller channel failure, tagged with the handler that hit it.
#[derive(Debug, thiserror::Error)]
#[error("{handler}: {error:#}")]
pub struct BridgeError {
    pub handler: String,
    pub error: anyhow::Error,
}

pub struct Bridge {
    store: ObjectStore,
    clusters: Arc<ClusterRegistry>,
    /// database holding the cluster descriptors
    cluster_db: String,
    controllers: Vec<BackendController>,
}

impl Bridge {
    pub fn new(store: ObjectStore, clusters: Arc<ClusterRegistry>, cluster_db: impl Into<String>) -> Self {
        Self { store, clusters, cluster_db: cluster_db.into(), controllers: Vec::new() }
    }

    /// Inject the registry and store into each handler and wrap it in a controller.
    pub fn add(&mut self, handlers: impl IntoIterator<Item = Box<dyn Handler>>) -> &mut Self {
        for mut h in handlers {
            h.set(self.clusters.clone(), self.store.clone());
            info!(handler = %h.name(), north = h.as_north().is_some(), south = h.as_south().is_some(), "handler added");
            self.controllers.push(BackendController::new(Arc::from(h), self.clusters.clone()));
        }
        self
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Bring up the cluster registry, then start every controller.
    pub async fn run(self, ctx: &CancellationToken) -> Result<BridgeHandle> {
        let registry = self
            .clusters
            .start(ctx, self.store.clone(), &self.cluster_db)
            .await
            .context("starting cluster registry")?;
        let (err_tx, errors) = mpsc::channel(64);
        let mut tasks = JoinSet::new();
        let count = self.controllers.len();
        for c in self.controllers {
            tasks.spawn(c.run(ctx.clone(), err_tx.clone()));
        }
        info!(controllers = count, clusters = self.clusters.len(), "bridge running");
        Ok(BridgeHandle { errors, tasks, registry })
    }
}

/// Running bridge. `errors` carries every controller channel failure.
pub struct BridgeHandle {
    pub errors: mpsc::Receiver<BridgeError>,
    tasks: JoinSet<RunSummary>,
    registry: JoinHandle<()>,
}

impl BridgeHandle {
    /// Wait for every controller (and the registry watch) to stop.
    pub async fn wait(mut self) -> Vec<RunSummary> {
        let mut out = Vec::new();
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(summary) => out.push(summary),
                Err(e) => warn!(error = %e, "controller task panicked"),
            }
        }
        if let Err(e) = self.registry.await {
            warn!(error = %e, "cluster registry task panicked");
        }
        out
    }
}
