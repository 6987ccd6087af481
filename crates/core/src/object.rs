//! Tagged object envelope: `{kind, metadata, spec}`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::Version;

/// A typed payload stored under a fixed kind (which is also its collection).
pub trait Spec: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Who produced the last write of an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// User or API surface.
    #[default]
    Api,
    /// A reconciler acting on control-plane state.
    North,
    /// A reconciler recording observed execution-cluster state.
    South,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Tenant partition within a database; empty for unpartitioned kinds.
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default)]
    pub is_delete: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object<S> {
    pub kind: String,
    pub metadata: Metadata,
    pub spec: S,
}

/// Schema-less form of an object as it sits in the store.
pub type RawObject = Object<serde_json::Value>;

impl<S: Spec> Object<S> {
    pub fn new(name: impl Into<String>, spec: S) -> Self {
        Self { kind: S::KIND.to_string(), metadata: Metadata::named(name), spec }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.metadata.workspace = workspace.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn into_raw(self) -> Result<RawObject> {
        Ok(Object { kind: self.kind, metadata: self.metadata, spec: serde_json::to_value(self.spec)? })
    }

    /// Decode a raw object without consulting a registry. The envelope kind
    /// must still match `S::KIND`.
    pub fn from_raw(raw: RawObject) -> Result<Self> {
        if raw.kind != S::KIND {
            return Err(Error::KindMismatch { stored: raw.kind, requested: S::KIND.to_string() });
        }
        Ok(Object { kind: raw.kind, metadata: raw.metadata, spec: serde_json::from_value(raw.spec)? })
    }
}

impl<S> Object<S> {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn version(&self) -> Version {
        self.metadata.version
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.is_delete
    }
}

impl RawObject {
    pub fn raw(kind: impl Into<String>, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Object { kind: kind.into(), metadata: Metadata::named(name), spec }
    }

    /// Whole-document JSON form (`{kind, metadata, spec}`).
    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        size: u32,
    }

    impl Spec for Widget {
        const KIND: &'static str = "widget";
    }

    #[test]
    fn typed_raw_roundtrip_keeps_metadata() {
        let obj = Object::new("w1", Widget { size: 3 }).with_workspace("ws").with_label("tier", "gold");
        let raw = obj.clone().into_raw().unwrap();
        assert_eq!(raw.kind, "widget");
        assert_eq!(raw.spec, serde_json::json!({ "size": 3 }));
        let back = Object::<Widget>::from_raw(raw).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn from_raw_rejects_foreign_kind() {
        let raw = RawObject::raw("gadget", "g", serde_json::json!({ "size": 1 }));
        let err = Object::<Widget>::from_raw(raw).unwrap_err();
        assert!(matches!(err, Error::KindMismatch { .. }));
    }

    #[test]
    fn document_shape_carries_metadata_fields() {
        let mut raw = RawObject::raw("widget", "w", serde_json::json!({}));
        raw.metadata.version = Version::INITIAL;
        let doc = raw.to_document().unwrap();
        assert_eq!(doc["metadata"]["version"], "1");
        assert_eq!(doc["metadata"]["is_delete"], false);
        assert_eq!(doc["metadata"]["origin"], "api");
    }
}
