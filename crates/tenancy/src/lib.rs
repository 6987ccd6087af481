//! Nimbus tenancy: a `workspace` document per tenant partition, realized as a
//! labelled namespace on the execution cluster it names.

#![forbid(unsafe_code)]

pub mod handler;
pub mod namespace;

use k8s_openapi::api::core::v1::Namespace;
use nimbus_core::{CoderRegistry, Lifecycle, Phase, Spec};
use nimbus_kubehub::{ResourceRegistry, ResourceType};
use serde::{Deserialize, Serialize};

pub use handler::WorkspaceHandler;

/// Phase table for workspaces.
pub const LIFECYCLE: Lifecycle = Lifecycle::workload(WorkspaceSpec::KIND);

/// Resource-registry key of the execution-side namespace kind.
pub const NAMESPACE_KIND: &str = "namespace";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    /// uid of the owning business group, empty for free-standing workspaces
    #[serde(default)]
    pub business_group: String,
    /// execution cluster hosting the namespace
    #[serde(default)]
    pub cluster: String,
    /// namespace name; the workspace name when empty
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub status: Phase,
    #[serde(default)]
    pub message: String,
}

impl Spec for WorkspaceSpec {
    const KIND: &'static str = "workspace";
}

impl WorkspaceSpec {
    pub fn namespace_or<'a>(&'a self, workspace: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            workspace
        } else {
            &self.namespace
        }
    }
}

pub fn register_kinds(coders: &CoderRegistry) {
    coders.register::<WorkspaceSpec>();
}

/// Namespaces are core/v1 and always served, so they never need discovery.
pub fn register_resources(resources: &ResourceRegistry) {
    resources.register(NAMESPACE_KIND, ResourceType::of::<Namespace>(false));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_to_init_and_round_trips_phase_as_tag() {
        let spec: WorkspaceSpec = serde_json::from_value(serde_json::json!({ "cluster": "c1" })).unwrap();
        assert_eq!(spec.status, Phase::Init);
        assert_eq!(spec.namespace_or("team-a"), "team-a");
        let v = serde_json::to_value(WorkspaceSpec { status: Phase::Running, ..spec }).unwrap();
        assert_eq!(v["status"], "RUNNING");
    }

    #[test]
    fn namespace_kind_resolves_without_a_store() {
        let reg = ResourceRegistry::new();
        register_resources(&reg);
        let rt = reg.cached(NAMESPACE_KIND).unwrap();
        assert_eq!(rt.api.kind, "Namespace");
        assert!(!rt.namespaced);
    }
}
