//! One execution cluster: its client, discovery, and per-resource watches.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, ResourceExt},
    discovery::{self, Discovery, Scope},
    runtime::{
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use nimbus_core::{Event, EventType, Version};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resources::ResourceType;

/// Unit delivered by a cluster watch.
pub type SouthEvent = Event<DynamicObject>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Client bundle for one cluster. Stopping it ends every watch it started.
pub struct ClusterClient {
    name: String,
    /// uid and version of the descriptor this client was built from
    source: (String, Version),
    client: Client,
    token: CancellationToken,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("name", &self.name)
            .field("version", &self.source.1)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ClusterClient {
    pub fn new(name: impl Into<String>, uid: impl Into<String>, version: Version, client: Client, parent: &CancellationToken) -> Self {
        Self { name: name.into(), source: (uid.into(), version), client, token: parent.child_token() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// True when built from exactly this descriptor revision.
    pub fn built_from(&self, uid: &str, version: Version) -> bool {
        self.source.0 == uid && self.source.1 == version
    }

    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            info!(cluster = %self.name, "stopping cluster client");
            self.token.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the client is stopped.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// Discover served resources (incl. CRDs).
    pub async fn discover(&self) -> Result<Vec<DiscoveredResource>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        debug!(cluster = %self.name, count = out.len(), "discovery complete");
        Ok(out)
    }

    /// Whether this cluster serves `rt`; only its API group is queried.
    pub async fn serves(&self, rt: &ResourceType) -> Result<bool> {
        let group = discovery::group(&self.client, &rt.api.group).await?;
        Ok(group.recommended_resources().iter().any(|(ar, _)| ar.kind == rt.api.kind && ar.version == rt.api.version))
    }

    pub fn api(&self, rt: &ResourceType, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        match (rt.namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &rt.api)),
            (true, None) | (false, None) => Ok(Api::all_with(self.client.clone(), &rt.api)),
            (false, Some(ns)) => Err(anyhow!("{} is cluster-scoped; namespace {} not allowed", rt.api.kind, ns)),
        }
    }

    /// Start list+watch for `rt` and forward it as ADDED/MODIFIED/DELETED.
    /// The watch ends when `ctx` is cancelled, the client is stopped, or the
    /// receiver is dropped.
    pub fn watch(&self, ctx: &CancellationToken, rt: &ResourceType, cap: usize) -> Result<mpsc::Receiver<SouthEvent>> {
        let api = self.api(rt, None)?;
        let (tx, rx) = mpsc::channel(cap.max(1));
        let ctx = ctx.clone();
        let stop = self.token.clone();
        let cluster = self.name.clone();
        let kind = rt.api.kind.clone();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            let mut state = WatchState::default();
            info!(cluster = %cluster, kind = %kind, "cluster watch started");
            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = stop.cancelled() => break,
                    next = stream.try_next() => next,
                };
                match next {
                    Ok(Some(ev)) => {
                        for out in state.apply(ev) {
                            counter!("cluster_watch_events_total", 1u64, "cluster" => cluster.clone());
                            if tx.send(out).await.is_err() {
                                debug!(cluster = %cluster, kind = %kind, "watch receiver dropped");
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!(cluster = %cluster, kind = %kind, "watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        counter!("cluster_watch_errors_total", 1u64, "cluster" => cluster.clone());
                        warn!(cluster = %cluster, kind = %kind, error = %e, "watch error; backing off");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            info!(cluster = %cluster, kind = %kind, "cluster watch stopped");
        });
        Ok(rx)
    }
}

/// Last seen object per key, so relists turn into precise add/modify/delete.
#[derive(Default)]
pub(crate) struct WatchState {
    known: FxHashMap<String, DynamicObject>,
}

fn key_of(obj: &DynamicObject) -> String {
    obj.metadata.uid.clone().unwrap_or_else(|| format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any()))
}

impl WatchState {
    pub(crate) fn apply(&mut self, ev: WatchEvent<DynamicObject>) -> Vec<SouthEvent> {
        match ev {
            WatchEvent::Applied(obj) => self.upsert(obj).into_iter().collect(),
            WatchEvent::Deleted(obj) => {
                self.known.remove(&key_of(&obj));
                vec![Event::new(EventType::Deleted, obj)]
            }
            WatchEvent::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let live: FxHashSet<String> = list.iter().map(key_of).collect();
                // dropped from the cluster while we were disconnected
                let stale: Vec<String> = self.known.keys().filter(|k| !live.contains(*k)).cloned().collect();
                let mut out: Vec<SouthEvent> = list.into_iter().filter_map(|obj| self.upsert(obj)).collect();
                for k in stale {
                    if let Some(obj) = self.known.remove(&k) {
                        out.push(Event::new(EventType::Deleted, obj));
                    }
                }
                out
            }
        }
    }

    fn upsert(&mut self, obj: DynamicObject) -> Option<SouthEvent> {
        let key = key_of(&obj);
        let rv = obj.metadata.resource_version.clone();
        match self.known.insert(key, obj.clone()) {
            None => Some(Event::new(EventType::Added, obj)),
            Some(prev) if rv.is_some() && prev.metadata.resource_version == rv => None,
            Some(_) => Some(Event::new(EventType::Modified, obj)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Namespace;
    use kube::core::ApiResource;

    fn ns(name: &str, rv: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, &ApiResource::erase::<Namespace>(&()));
        o.metadata.uid = Some(format!("uid-{name}"));
        o.metadata.resource_version = Some(rv.to_string());
        o
    }

    fn kinds(evs: &[SouthEvent]) -> Vec<(EventType, String)> {
        evs.iter().map(|e| (e.event_type, e.object.name_any())).collect()
    }

    #[test]
    fn applied_distinguishes_new_from_changed() {
        let mut st = WatchState::default();
        assert_eq!(kinds(&st.apply(WatchEvent::Applied(ns("a", "1")))), vec![(EventType::Added, "a".into())]);
        assert!(st.apply(WatchEvent::Applied(ns("a", "1"))).is_empty());
        assert_eq!(kinds(&st.apply(WatchEvent::Applied(ns("a", "2")))), vec![(EventType::Modified, "a".into())]);
        assert_eq!(kinds(&st.apply(WatchEvent::Deleted(ns("a", "3")))), vec![(EventType::Deleted, "a".into())]);
    }

    #[test]
    fn relist_reports_objects_gone_while_disconnected() {
        let mut st = WatchState::default();
        st.apply(WatchEvent::Restarted(vec![ns("a", "1"), ns("b", "1")]));
        let evs = st.apply(WatchEvent::Restarted(vec![ns("a", "1"), ns("c", "4")]));
        assert_eq!(kinds(&evs), vec![(EventType::Added, "c".into()), (EventType::Deleted, "b".into())]);
    }
}
