//! Nimbus kubehub: the live set of execution clusters and everything needed
//! to talk to them (clients, resource kinds, watches, conflict retry).

#![forbid(unsafe_code)]

pub mod builder;
pub mod client;
pub mod registry;
pub mod resources;
pub mod retry;

use nimbus_core::{CoderRegistry, Spec};
use serde::{Deserialize, Serialize};

pub use builder::{ClientBuilder, KubeconfigBuilder};
pub use client::{ClusterClient, DiscoveredResource, SouthEvent};
pub use registry::{ClusterChange, ClusterRegistry};
pub use resources::{ResourceRegistry, ResourceType, ResourceTypeSpec};
pub use retry::{is_conflict, retry_on_conflict, RetryConfig};

/// Cluster descriptor: one document per execution cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// kubeconfig YAML used to build the client
    pub config: String,
}

impl Spec for ClusterSpec {
    const KIND: &'static str = "cluster";
}

/// Register the kinds this crate persists.
pub fn register_kinds(coders: &CoderRegistry) {
    coders.register::<ClusterSpec>().register::<ResourceTypeSpec>();
}
