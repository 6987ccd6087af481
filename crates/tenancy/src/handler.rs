//! Workspace reconciler.
//!
//! North: INIT/UPDATE ensure the namespace on the workspace's cluster, DELETE
//! removes it. South: namespace events record the observed phase back onto
//! the workspace (origin `south`); the deletion of a namespace whose workspace
//! asked for it removes the workspace document.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::core::DynamicObject;
use metrics::counter;
use nimbus_bridge::{ClientInjectable, Handler, NorthHandler, SouthHandler};
use nimbus_core::{Error, Filter, Lifecycle, Object, Origin, Phase, RawObject, Spec, Version};
use nimbus_kubehub::{ClusterClient, ClusterRegistry, ResourceRegistry, RetryConfig, SouthEvent};
use nimbus_store::{ApplyOptions, ObjectStore, WatchStream};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::namespace;
use crate::{WorkspaceSpec, LIFECYCLE, NAMESPACE_KIND};

pub struct WorkspaceHandler {
    /// tenant database holding the workspaces
    db: String,
    resources: Arc<ResourceRegistry>,
    retry: RetryConfig,
    queue_cap: usize,
    store: Option<ObjectStore>,
    clusters: Option<Arc<ClusterRegistry>>,
}

impl WorkspaceHandler {
    pub fn new(db: impl Into<String>, resources: Arc<ResourceRegistry>) -> Self {
        Self { db: db.into(), resources, retry: RetryConfig::default(), queue_cap: 256, store: None, clusters: None }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn store(&self) -> Result<&ObjectStore> {
        self.store.as_ref().ok_or_else(|| anyhow!("workspace handler used before injection"))
    }

    fn cluster(&self, name: &str) -> Option<Arc<ClusterClient>> {
        self.clusters.as_ref()?.get(name)
    }

    async fn record(&self, workspace: &str, phase: Phase, message: &str, origin: Origin) -> Result<()> {
        let patch = RawObject::raw(WorkspaceSpec::KIND, workspace, json!({ "status": phase, "message": message }));
        let opts = ApplyOptions::new().path("spec.status").path("spec.message").origin(origin).existing_only();
        let applied = match self.store()?.apply(&self.db, WorkspaceSpec::KIND, workspace, patch, &opts).await {
            Ok(applied) => applied,
            Err(e) if e.is_not_found() => {
                debug!(workspace, phase = %phase, "workspace gone; phase not recorded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if applied.changed {
            debug!(workspace, phase = %phase, origin = ?origin, "workspace phase recorded");
        }
        Ok(())
    }

    /// Current workspace, `None` when it no longer exists.
    async fn current(&self, name: &str) -> Result<Option<Object<WorkspaceSpec>>> {
        match self.store()?.get_typed::<WorkspaceSpec>(&self.db, name, None).await {
            Ok(ws) => Ok(Some(ws)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn provision(&self, ws: &Object<WorkspaceSpec>) -> Result<()> {
        let name = ws.name();
        let res = async {
            let cluster = self
                .cluster(&ws.spec.cluster)
                .ok_or_else(|| anyhow!("cluster {:?} is not registered", ws.spec.cluster))?;
            let rt = self.resources.resolve(NAMESPACE_KIND).await?;
            let labels = namespace::labels(&self.db, name);
            namespace::ensure(&cluster, &rt, &self.retry, ws.spec.namespace_or(name), &labels).await
        }
        .await;
        match res {
            // same write the namespace watch would make; keeps an already
            // present namespace from leaving the workspace in INIT
            Ok(live) if !namespace::is_terminating(&live) => self.record(name, Phase::Running, "", Origin::South).await,
            Ok(_) => Ok(()),
            Err(e) => {
                counter!("workspace_provision_errors_total", 1u64);
                self.record(name, Phase::Fail, &format!("{:#}", e), Origin::North).await?;
                Err(e.context(format!("provisioning workspace {}", name)))
            }
        }
    }

    /// Remove the namespace; finish the deletion at once when there is
    /// nothing left on the cluster.
    async fn deprovision(&self, ws: &Object<WorkspaceSpec>) -> Result<()> {
        let name = ws.name();
        let removed = match self.cluster(&ws.spec.cluster) {
            Some(cluster) => {
                let rt = self.resources.resolve(NAMESPACE_KIND).await?;
                namespace::remove(&cluster, &rt, ws.spec.namespace_or(name)).await?
            }
            None => false,
        };
        if !removed {
            self.finish_delete(name).await?;
        }
        Ok(())
    }

    async fn finish_delete(&self, name: &str) -> Result<()> {
        match self.store()?.delete(&self.db, WorkspaceSpec::KIND, name, None).await {
            Ok(_) => {
                info!(workspace = name, "workspace removed");
                Ok(())
            }
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The workspace a namespace event on `cluster` belongs to.
    async fn owner(&self, cluster: &str, obj: &DynamicObject) -> Result<Option<Object<WorkspaceSpec>>> {
        let Some(name) = namespace::managed_workspace(obj, &self.db) else { return Ok(None) };
        let ws = self.current(name).await?;
        Ok(ws.filter(|ws| ws.spec.cluster == cluster))
    }

    async fn observed(&self, cluster: &str, obj: DynamicObject) -> Result<()> {
        let Some(ws) = self.owner(cluster, &obj).await? else { return Ok(()) };
        if namespace::is_terminating(&obj) || !LIFECYCLE.can_transition(ws.spec.status, Phase::Running) {
            return Ok(());
        }
        self.record(ws.name(), Phase::Running, "", Origin::South).await
    }
}

impl ClientInjectable for WorkspaceHandler {
    fn set(&mut self, clusters: Arc<ClusterRegistry>, store: ObjectStore) {
        self.clusters = Some(clusters);
        self.store = Some(store);
    }
}

impl Handler for WorkspaceHandler {
    fn name(&self) -> &str {
        WorkspaceSpec::KIND
    }

    fn as_north(&self) -> Option<&dyn NorthHandler> {
        Some(self)
    }

    fn as_south(&self) -> Option<&dyn SouthHandler> {
        Some(self)
    }
}

#[async_trait]
impl NorthHandler for WorkspaceHandler {
    fn lifecycle(&self) -> Option<Lifecycle> {
        Some(LIFECYCLE)
    }

    async fn north_event_ch(&self, ctx: &CancellationToken) -> Result<WatchStream<RawObject>> {
        Ok(self.store()?.watch_event(ctx, &self.db, WorkspaceSpec::KIND, Version::UNSET, Filter::new()))
    }

    async fn north_on_add(&self, obj: RawObject) -> Result<()> {
        self.north_on_update(obj).await
    }

    async fn north_on_update(&self, obj: RawObject) -> Result<()> {
        let ws: Object<WorkspaceSpec> = self.store()?.coders().decode(obj).context("decoding workspace")?;
        if self.current(ws.name()).await?.is_none() {
            debug!(workspace = %ws.name(), "stale event for a removed workspace; skipped");
            return Ok(());
        }
        match ws.spec.status {
            Phase::Init | Phase::Update => self.provision(&ws).await,
            Phase::Delete => self.deprovision(&ws).await,
            _ => Ok(()),
        }
    }

    async fn north_on_delete(&self, obj: RawObject) -> Result<()> {
        let ws: Object<WorkspaceSpec> = self.store()?.coders().decode(obj).context("decoding workspace")?;
        let Some(cluster) = self.cluster(&ws.spec.cluster) else { return Ok(()) };
        let rt = self.resources.resolve(NAMESPACE_KIND).await?;
        namespace::remove(&cluster, &rt, ws.spec.namespace_or(ws.name())).await?;
        Ok(())
    }
}

#[async_trait]
impl SouthHandler for WorkspaceHandler {
    async fn south_event_ch(&self, ctx: &CancellationToken, cluster: &ClusterClient) -> Result<Option<mpsc::Receiver<SouthEvent>>> {
        let rt = self.resources.resolve(NAMESPACE_KIND).await?;
        Ok(Some(cluster.watch(ctx, &rt, self.queue_cap)?))
    }

    async fn south_on_add(&self, cluster: &str, obj: DynamicObject) -> Result<()> {
        self.observed(cluster, obj).await
    }

    async fn south_on_update(&self, cluster: &str, obj: DynamicObject) -> Result<()> {
        self.observed(cluster, obj).await
    }

    async fn south_on_delete(&self, cluster: &str, obj: DynamicObject) -> Result<()> {
        let Some(ws) = self.owner(cluster, &obj).await? else { return Ok(()) };
        match ws.spec.status {
            Phase::Delete => self.finish_delete(ws.name()).await,
            current if LIFECYCLE.can_transition(current, Phase::Sync) => {
                warn!(workspace = %ws.name(), cluster, "namespace removed outside the control plane");
                self.record(ws.name(), Phase::Sync, "namespace missing on cluster", Origin::South).await
            }
            _ => Ok(()),
        }
    }
}
