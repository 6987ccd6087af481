//! Namespace writes on one cluster.

use std::collections::BTreeMap;

use anyhow::Result;
use kube::api::{DeleteParams, PostParams};
use kube::core::DynamicObject;
use nimbus_kubehub::{retry_on_conflict, ClusterClient, ResourceType, RetryConfig};
use tracing::{debug, info};

pub const TENANT_LABEL: &str = "nimbus.io/tenant";
pub const WORKSPACE_LABEL: &str = "nimbus.io/workspace";

pub fn labels(tenant: &str, workspace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(TENANT_LABEL.to_string(), tenant.to_string()), (WORKSPACE_LABEL.to_string(), workspace.to_string())])
}

/// Workspace name of a namespace managed for `tenant`.
pub fn managed_workspace<'a>(obj: &'a DynamicObject, tenant: &str) -> Option<&'a str> {
    let labels = obj.metadata.labels.as_ref()?;
    if labels.get(TENANT_LABEL).map(String::as_str) != Some(tenant) {
        return None;
    }
    labels.get(WORKSPACE_LABEL).map(String::as_str)
}

pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.data.pointer("/status/phase").and_then(|v| v.as_str()) == Some("Terminating")
}

fn desired(rt: &ResourceType, name: &str, labels: &BTreeMap<String, String>) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &rt.api);
    obj.metadata.labels = Some(labels.clone());
    obj
}

/// Create the namespace or add our labels to an existing one.
pub async fn ensure(
    client: &ClusterClient,
    rt: &ResourceType,
    retry: &RetryConfig,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<DynamicObject> {
    let api = client.api(rt, None)?;
    let api = &api;
    let obj = retry_on_conflict(retry, move || async move {
        match api.get_opt(name).await? {
            None => {
                info!(cluster = %client.name(), namespace = name, "creating namespace");
                api.create(&PostParams::default(), &desired(rt, name, labels)).await
            }
            Some(mut live) => {
                let have = live.metadata.labels.get_or_insert_with(BTreeMap::new);
                if labels.iter().all(|(k, v)| have.get(k) == Some(v)) {
                    return Ok(live);
                }
                have.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
                debug!(cluster = %client.name(), namespace = name, "labelling existing namespace");
                api.replace(name, &PostParams::default(), &live).await
            }
        }
    })
    .await?;
    Ok(obj)
}

/// Delete the namespace. `false` when it was already gone.
pub async fn remove(client: &ClusterClient, rt: &ResourceType, name: &str) -> Result<bool> {
    let api = client.api(rt, None)?;
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(cluster = %client.name(), namespace = name, "namespace deletion requested");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}
