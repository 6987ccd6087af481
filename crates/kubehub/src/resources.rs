//! Resource-kind registry: store kind name -> execution-side API resource.
//!
//! Lookups hit an in-memory table first; unknown kinds fall through to the
//! persisted `resourcetype` collection and are cached from then on, so kinds
//! defined after startup resolve without a restart.

use arc_swap::ArcSwap;
use kube::core::{ApiResource, GroupVersionKind, Resource};
use metrics::counter;
use nimbus_core::{Error, Result, Spec};
use nimbus_store::ObjectStore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::DiscoveredResource;

/// Persisted description of an execution-side resource type, named by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    #[serde(default)]
    pub namespaced: bool,
}

impl Spec for ResourceTypeSpec {
    const KIND: &'static str = "resourcetype";
}

#[derive(Debug, Clone)]
pub struct ResourceType {
    pub api: ApiResource,
    pub namespaced: bool,
}

impl ResourceType {
    /// For statically typed k8s-openapi resources.
    pub fn of<K: Resource<DynamicType = ()>>(namespaced: bool) -> Self {
        Self { api: ApiResource::erase::<K>(&()), namespaced }
    }

    pub fn from_spec(spec: &ResourceTypeSpec) -> Self {
        let gvk = GroupVersionKind::gvk(&spec.group, &spec.version, &spec.kind);
        Self { api: ApiResource::from_gvk_with_plural(&gvk, &spec.plural), namespaced: spec.namespaced }
    }
}

impl From<&DiscoveredResource> for ResourceType {
    fn from(d: &DiscoveredResource) -> Self {
        let gvk = GroupVersionKind::gvk(&d.group, &d.version, &d.kind);
        Self { api: ApiResource::from_gvk_with_plural(&gvk, &d.plural), namespaced: d.namespaced }
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    cache: ArcSwap<FxHashMap<String, ResourceType>>,
    fallback: Option<(ObjectStore, String)>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve misses from the `resourcetype` collection of `db`.
    pub fn with_store(store: ObjectStore, db: impl Into<String>) -> Self {
        Self { cache: ArcSwap::default(), fallback: Some((store, db.into())) }
    }

    pub fn register(&self, kind: &str, rt: ResourceType) {
        self.cache.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(kind.to_string(), rt.clone());
            next
        });
    }

    pub fn cached(&self, kind: &str) -> Option<ResourceType> {
        self.cache.load().get(kind).cloned()
    }

    pub async fn resolve(&self, kind: &str) -> Result<ResourceType> {
        if let Some(rt) = self.cached(kind) {
            return Ok(rt);
        }
        let Some((store, db)) = &self.fallback else {
            return Err(Error::Unregistered(format!("resource kind {}", kind)));
        };
        match store.get_typed::<ResourceTypeSpec>(db, kind, None).await {
            Ok(obj) => {
                let rt = ResourceType::from_spec(&obj.spec);
                self.register(kind, rt.clone());
                counter!("resource_registry_fallback_total", 1u64);
                debug!(kind, api = %rt.api.kind, "resource kind resolved from store");
                Ok(rt)
            }
            Err(e) if e.is_not_found() => Err(Error::Unregistered(format!("resource kind {}", kind))),
            Err(e) => Err(e),
        }
    }

    /// Cache discovered resources under their lowercased kind, keeping
    /// explicit registrations. Returns the number added.
    pub fn learn(&self, discovered: &[DiscoveredResource]) -> usize {
        let mut added = 0usize;
        self.cache.rcu(|cur| {
            added = 0;
            let mut next = FxHashMap::clone(cur);
            for d in discovered {
                next.entry(d.kind.to_ascii_lowercase()).or_insert_with(|| {
                    added += 1;
                    ResourceType::from(d)
                });
            }
            next
        });
        added
    }
}
