//! Capabilities a resource-kind integration implements.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::core::DynamicObject;
use nimbus_core::{Lifecycle, RawObject};
use nimbus_kubehub::{ClusterClient, ClusterRegistry, SouthEvent};
use nimbus_store::{ObjectStore, WatchStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Control plane -> clusters.
#[async_trait]
pub trait NorthHandler: Send + Sync {
    /// Declared phase table; `None` dispatches every event ungated.
    fn lifecycle(&self) -> Option<Lifecycle> {
        None
    }

    /// The single store watch this handler reacts to.
    async fn north_event_ch(&self, ctx: &CancellationToken) -> Result<WatchStream<RawObject>>;

    async fn north_on_add(&self, obj: RawObject) -> Result<()>;
    async fn north_on_update(&self, obj: RawObject) -> Result<()>;
    async fn north_on_delete(&self, obj: RawObject) -> Result<()>;
}

/// Clusters -> control plane.
#[async_trait]
pub trait SouthHandler: Send + Sync {
    /// Watch this handler's resource on one cluster. `Ok(None)` when the
    /// cluster does not expose it.
    async fn south_event_ch(&self, ctx: &CancellationToken, cluster: &ClusterClient) -> Result<Option<mpsc::Receiver<SouthEvent>>>;

    /// One watch per live cluster. Clusters that fail to open are skipped.
    async fn south_event_chs(
        &self,
        ctx: &CancellationToken,
        clusters: &ClusterRegistry,
    ) -> Result<Vec<(String, mpsc::Receiver<SouthEvent>)>> {
        let mut out = Vec::new();
        for cluster in clusters.clients() {
            match self.south_event_ch(ctx, &cluster).await {
                Ok(Some(rx)) => out.push((cluster.name().to_string(), rx)),
                Ok(None) => {}
                Err(e) => warn!(cluster = %cluster.name(), error = %format!("{:#}", e), "south watch not opened"),
            }
        }
        Ok(out)
    }

    async fn south_on_add(&self, cluster: &str, obj: DynamicObject) -> Result<()>;
    async fn south_on_update(&self, cluster: &str, obj: DynamicObject) -> Result<()>;
    async fn south_on_delete(&self, cluster: &str, obj: DynamicObject) -> Result<()>;
}

/// Receives the shared cluster registry and store before the bridge starts.
pub trait ClientInjectable {
    fn set(&mut self, clusters: Arc<ClusterRegistry>, store: ObjectStore);
}

/// A resource-kind integration exposing any subset of the two directions.
pub trait Handler: ClientInjectable + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn as_north(&self) -> Option<&dyn NorthHandler> {
        None
    }

    fn as_south(&self) -> Option<&dyn SouthHandler> {
        None
    }
}
