//! Relation edges: typed hyperedges stored as ordinary objects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::{Object, Spec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelationKind {
    AccountRole,
    AccountBusinessGroup,
    BusinessGroupRole,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::AccountRole => "ACCOUNTROLE",
            RelationKind::AccountBusinessGroup => "ACCOUNTBUSINESSGROUP",
            RelationKind::BusinessGroupRole => "BUSINESSGROUPROLE",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role names used as keys in `RelationSpec::resources`.
pub mod role {
    pub const ACCOUNT: &str = "account";
    pub const BUSINESS_GROUP: &str = "businessgroup";
    pub const ROLE: &str = "role";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub relation_kind: RelationKind,
    /// role name -> uid of the linked object
    pub resources: BTreeMap<String, String>,
}

impl Spec for RelationSpec {
    const KIND: &'static str = "relation";
}

impl RelationSpec {
    pub fn new<'a>(kind: RelationKind, resources: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            relation_kind: kind,
            resources: resources.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    pub fn get(&self, role: &str) -> Option<&str> {
        self.resources.get(role).map(String::as_str)
    }

    /// Deterministic object name: one edge per distinct resource tuple.
    pub fn edge_name(&self) -> String {
        let mut name = self.relation_kind.as_str().to_ascii_lowercase();
        for uid in self.resources.values() {
            name.push('-');
            name.push_str(uid);
        }
        name
    }

    pub fn into_object(self) -> Object<RelationSpec> {
        let name = self.edge_name();
        Object::new(name, self)
    }

    /// Dotted document path of a resource role, for filters.
    pub fn path(role: &str) -> String {
        format!("spec.resources.{role}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_uppercase_tag() {
        let v = serde_json::to_value(RelationKind::AccountBusinessGroup).unwrap();
        assert_eq!(v, serde_json::json!("ACCOUNTBUSINESSGROUP"));
        assert_eq!(v.as_str(), Some(RelationKind::AccountBusinessGroup.as_str()));
    }

    #[test]
    fn edge_name_is_order_independent() {
        let a = RelationSpec::new(RelationKind::AccountRole, [("role", "r1"), ("account", "a1"), ("businessgroup", "g1")]);
        let b = RelationSpec::new(RelationKind::AccountRole, [("businessgroup", "g1"), ("account", "a1"), ("role", "r1")]);
        assert_eq!(a.edge_name(), b.edge_name());
        assert_eq!(a.edge_name(), "accountrole-a1-g1-r1");
        assert_eq!(a.get(role::ROLE), Some("r1"));
    }
}
