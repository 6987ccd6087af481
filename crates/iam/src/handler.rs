//! North handlers feeding the permission graph: one per reacting kind, all
//! sharing the projection lock.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nimbus_bridge::{ClientInjectable, Handler, NorthHandler};
use nimbus_core::{Filter, RawObject, Spec, Version};
use nimbus_kubehub::ClusterRegistry;
use nimbus_store::{ObjectStore, WatchStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::graph::PermissionGraph;
use crate::kinds::{AccountSpec, BusinessGroupSpec, RoleSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Account,
    BusinessGroup,
    Role,
}

impl GraphKind {
    pub const ALL: [GraphKind; 3] = [GraphKind::Account, GraphKind::BusinessGroup, GraphKind::Role];

    pub fn as_str(self) -> &'static str {
        match self {
            GraphKind::Account => AccountSpec::KIND,
            GraphKind::BusinessGroup => BusinessGroupSpec::KIND,
            GraphKind::Role => RoleSpec::KIND,
        }
    }
}

pub struct GraphHandler {
    kind: GraphKind,
    db: String,
    projections: Arc<Mutex<()>>,
    graph: Option<PermissionGraph>,
}

impl GraphHandler {
    pub fn new(kind: GraphKind, db: impl Into<String>, projections: Arc<Mutex<()>>) -> Self {
        Self { kind, db: db.into(), projections, graph: None }
    }

    fn graph(&self) -> Result<&PermissionGraph> {
        self.graph.as_ref().ok_or_else(|| anyhow!("{} handler used before injection", self.kind.as_str()))
    }

    async fn changed(&self, obj: RawObject) -> Result<()> {
        let graph = self.graph()?;
        let coders = graph.store().coders();
        let name = obj.metadata.name.clone();
        let res = match self.kind {
            GraphKind::Account => {
                let account = coders.decode::<AccountSpec>(obj)?;
                graph.account_changed(&account).await.map(|_| ())
            }
            GraphKind::BusinessGroup => {
                let group = coders.decode::<BusinessGroupSpec>(obj)?;
                graph.group_changed(&group).await
            }
            GraphKind::Role => graph.role_changed(&obj.metadata.uid).await,
        };
        res.with_context(|| format!("reconciling {} {}", self.kind.as_str(), name))
    }
}

impl ClientInjectable for GraphHandler {
    fn set(&mut self, _clusters: Arc<ClusterRegistry>, store: ObjectStore) {
        self.graph = Some(PermissionGraph::with_lock(store, self.db.clone(), self.projections.clone()));
    }
}

impl Handler for GraphHandler {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn as_north(&self) -> Option<&dyn NorthHandler> {
        Some(self)
    }
}

#[async_trait]
impl NorthHandler for GraphHandler {
    async fn north_event_ch(&self, ctx: &CancellationToken) -> Result<WatchStream<RawObject>> {
        Ok(self.graph()?.store().watch_event(ctx, &self.db, self.kind.as_str(), Version::UNSET, Filter::new()))
    }

    async fn north_on_add(&self, obj: RawObject) -> Result<()> {
        self.changed(obj).await
    }

    async fn north_on_update(&self, obj: RawObject) -> Result<()> {
        self.changed(obj).await
    }

    async fn north_on_delete(&self, obj: RawObject) -> Result<()> {
        let graph = self.graph()?;
        let uid = obj.metadata.uid.as_str();
        let res = match self.kind {
            GraphKind::Account => graph.account_deleted(uid).await,
            GraphKind::BusinessGroup => graph.group_deleted(uid).await,
            GraphKind::Role => graph.role_deleted(uid).await,
        };
        res.with_context(|| format!("removing {} {}", self.kind.as_str(), obj.metadata.name))
    }
}
