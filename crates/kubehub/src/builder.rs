//! Turning a cluster descriptor into a kube client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use nimbus_core::Object;

use crate::ClusterSpec;

#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build(&self, cluster: &Object<ClusterSpec>) -> Result<Client>;
}

/// Reads `spec.config` as kubeconfig YAML and uses its current context.
/// Building does not contact the server.
#[derive(Debug, Clone, Default)]
pub struct KubeconfigBuilder {
    /// Overrides the kubeconfig's current-context when set.
    pub context: Option<String>,
}

#[async_trait]
impl ClientBuilder for KubeconfigBuilder {
    async fn build(&self, cluster: &Object<ClusterSpec>) -> Result<Client> {
        let name = cluster.name();
        let kubeconfig = Kubeconfig::from_yaml(&cluster.spec.config)
            .with_context(|| format!("parsing kubeconfig of cluster {}", name))?;
        let options = KubeConfigOptions { context: self.context.clone(), ..Default::default() };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .with_context(|| format!("resolving kubeconfig of cluster {}", name))?;
        Client::try_from(config).with_context(|| format!("building client for cluster {}", name))
    }
}
