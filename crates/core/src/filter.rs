//! Document predicates used by list, get-by-filter and watch.
//!
//! Field paths are dotted and rooted at the document (`spec.relation_kind`,
//! `metadata.labels.team`). A predicate on an array-valued path matches when
//! any element equals the expected value.

use serde_json::Value as Json;
use smallvec::SmallVec;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    name: Option<String>,
    workspace: Option<String>,
    uid: Option<String>,
    fields: SmallVec<[(String, Json); 4]>,
    include_deleted: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn field(mut self, path: impl Into<String>, value: impl Into<Json>) -> Self {
        self.fields.push((path.into(), value.into()));
        self
    }

    pub fn label(self, key: &str, value: impl Into<String>) -> Self {
        self.field(format!("metadata.labels.{key}"), Json::String(value.into()))
    }

    /// Also match tombstoned documents (excluded by default).
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn name_value(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn workspace_value(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn uid_value(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn matches(&self, doc: &Json) -> bool {
        if !self.include_deleted && lookup(doc, "metadata.is_delete").and_then(Json::as_bool).unwrap_or(false) {
            return false;
        }
        if let Some(n) = &self.name {
            if lookup(doc, "metadata.name").and_then(Json::as_str) != Some(n.as_str()) {
                return false;
            }
        }
        if let Some(w) = &self.workspace {
            if lookup(doc, "metadata.workspace").and_then(Json::as_str).unwrap_or("") != w {
                return false;
            }
        }
        if let Some(u) = &self.uid {
            if lookup(doc, "metadata.uid").and_then(Json::as_str) != Some(u.as_str()) {
                return false;
            }
        }
        self.fields.iter().all(|(path, want)| match lookup(doc, path) {
            Some(Json::Array(items)) if !want.is_array() => items.iter().any(|v| v == want),
            Some(v) => v == want,
            None => want.is_null(),
        })
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |cur, seg| match cur {
        Json::Object(map) => map.get(seg),
        Json::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Json {
        json!({
            "kind": "relation",
            "metadata": { "name": "r1", "workspace": "", "uid": "u-1", "is_delete": false, "labels": { "team": "a" } },
            "spec": { "relation_kind": "ACCOUNTROLE", "resources": { "account": "a1", "role": "r1" }, "tags": ["x", "y"] }
        })
    }

    #[test]
    fn matches_identity_and_fields() {
        let d = doc();
        assert!(Filter::new().name("r1").matches(&d));
        assert!(Filter::new().workspace("").uid("u-1").matches(&d));
        assert!(Filter::new().field("spec.relation_kind", "ACCOUNTROLE").field("spec.resources.role", "r1").matches(&d));
        assert!(!Filter::new().field("spec.resources.role", "r2").matches(&d));
        assert!(Filter::new().label("team", "a").matches(&d));
    }

    #[test]
    fn array_paths_match_any_element() {
        let d = doc();
        assert!(Filter::new().field("spec.tags", "y").matches(&d));
        assert!(!Filter::new().field("spec.tags", "z").matches(&d));
    }

    #[test]
    fn tombstones_hidden_unless_requested() {
        let mut d = doc();
        d["metadata"]["is_delete"] = json!(true);
        assert!(!Filter::new().matches(&d));
        assert!(Filter::new().include_deleted().matches(&d));
    }

    #[test]
    fn lookup_walks_arrays_by_index() {
        let d = doc();
        assert_eq!(lookup(&d, "spec.tags.1"), Some(&json!("y")));
        assert_eq!(lookup(&d, "spec.missing.x"), None);
    }
}
