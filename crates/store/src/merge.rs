//! Path-scoped merge used by `ObjectStore::apply`.
//!
//! For each merge path the subtree of the incoming document is copied into the
//! stored one wherever the two differ. Objects merge key by key, so keys the
//! caller did not send survive; arrays and scalars are replaced wholesale.

use nimbus_core::filter::lookup;
use nimbus_core::{Error, Result};
use serde_json::{Map, Value as Json};

pub const DEFAULT_PATHS: &[&str] = &["spec"];

const MERGEABLE_METADATA: &[&str] = &["metadata.labels", "metadata.annotations", "metadata.namespace"];

/// Reject paths that would rewrite identity or bookkeeping fields.
pub fn validate_path(path: &str) -> Result<()> {
    if path == "spec" || path.starts_with("spec.") {
        return Ok(());
    }
    let allowed = MERGEABLE_METADATA
        .iter()
        .any(|p| path == *p || path.strip_prefix(p).map(|rest| rest.starts_with('.')).unwrap_or(false));
    if allowed {
        Ok(())
    } else {
        Err(Error::Invalid(format!("merge path {:?} is not mergeable", path)))
    }
}

/// Merge `new` into `old` at every path; true if anything changed.
pub fn merge_paths<'a>(old: &mut Json, new: &Json, paths: impl IntoIterator<Item = &'a str>) -> Result<bool> {
    let mut changed = false;
    for path in paths {
        validate_path(path)?;
        changed |= merge_path(old, new, path);
    }
    Ok(changed)
}

fn merge_path(old: &mut Json, new: &Json, path: &str) -> bool {
    let Some(src) = lookup(new, path) else { return false };
    if lookup(old, path) == Some(src) {
        return false;
    }
    merge_value(ensure_path(old, path), src)
}

fn merge_value(dst: &mut Json, src: &Json) -> bool {
    if let (Json::Object(d), Json::Object(s)) = (&mut *dst, src) {
        let mut changed = false;
        for (k, v) in s {
            match d.get_mut(k) {
                Some(dv) => changed |= merge_value(dv, v),
                None => {
                    d.insert(k.clone(), v.clone());
                    changed = true;
                }
            }
        }
        return changed;
    }
    if *dst != *src {
        *dst = src.clone();
        true
    } else {
        false
    }
}

fn ensure_path<'a>(root: &'a mut Json, path: &str) -> &'a mut Json {
    let mut cur = root;
    for seg in path.split('.') {
        if !cur.is_object() {
            *cur = Json::Object(Map::new());
        }
        let Json::Object(map) = cur else { unreachable!("replaced with an object above") };
        cur = map.entry(seg.to_string()).or_insert(Json::Null);
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_subtrees_are_noops() {
        let mut old = json!({ "spec": { "a": 1, "b": [1, 2] } });
        let new = json!({ "spec": { "a": 1, "b": [1, 2] } });
        assert!(!merge_paths(&mut old, &new, DEFAULT_PATHS.iter().copied()).unwrap());
    }

    #[test]
    fn keys_absent_from_new_are_preserved() {
        let mut old = json!({ "spec": { "password": "x", "email": "a@b" } });
        let new = json!({ "spec": { "password": "y" } });
        assert!(merge_paths(&mut old, &new, ["spec"]).unwrap());
        assert_eq!(old, json!({ "spec": { "password": "y", "email": "a@b" } }));
    }

    #[test]
    fn scoped_path_leaves_siblings_alone() {
        let mut old = json!({ "spec": { "x": { "v": 1 }, "y": "keep" } });
        let new = json!({ "spec": { "x": { "v": 2 }, "y": "other" } });
        assert!(merge_paths(&mut old, &new, ["spec.x"]).unwrap());
        assert_eq!(old["spec"]["x"]["v"], 2);
        assert_eq!(old["spec"]["y"], "keep");
    }

    #[test]
    fn arrays_replace_wholesale_and_missing_parents_are_created() {
        let mut old = json!({ "spec": { "roles": ["r1", "r2"] } });
        let new = json!({ "spec": { "roles": ["r2"] }, "metadata": { "labels": { "team": "a" } } });
        assert!(merge_paths(&mut old, &new, ["spec", "metadata.labels"]).unwrap());
        assert_eq!(old["spec"]["roles"], json!(["r2"]));
        assert_eq!(old["metadata"]["labels"]["team"], "a");
    }

    #[test]
    fn identity_paths_are_rejected() {
        for p in ["metadata", "metadata.version", "metadata.uid", "kind", "metadata.labelsx"] {
            assert!(validate_path(p).is_err(), "{p} should be rejected");
        }
        validate_path("metadata.labels.team").unwrap();
    }
}
