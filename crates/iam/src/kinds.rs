//! IAM document kinds. Cross-references between kinds are by uid, except
//! the menu/resource/operation catalogue which is keyed by name.

use std::collections::{BTreeMap, BTreeSet};

use nimbus_core::Spec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    /// business-group uid -> role uids granted in that group. Revoke a
    /// group by sending an empty set: apply merges maps key by key.
    #[serde(default)]
    pub grants: BTreeMap<String, BTreeSet<String>>,
}

impl Spec for AccountSpec {
    const KIND: &'static str = "account";
}

/// menu name -> resource name -> operation names
pub type RoleTree = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(default)]
    pub tree: RoleTree,
}

impl Spec for RoleSpec {
    const KIND: &'static str = "role";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessGroupSpec {
    /// account uids
    #[serde(default)]
    pub owners: BTreeSet<String>,
    /// account uids
    #[serde(default)]
    pub members: BTreeSet<String>,
    /// role uids this group offers
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// cluster hosting the group's workspace
    #[serde(default)]
    pub cluster: String,
}

impl Spec for BusinessGroupSpec {
    const KIND: &'static str = "businessgroup";
}

impl BusinessGroupSpec {
    pub fn accounts(&self) -> BTreeSet<&str> {
        self.owners.iter().chain(self.members.iter()).map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuSpec {
    /// parent menu name; empty at the root
    #[serde(default)]
    pub parent: String,
}

impl Spec for MenuSpec {
    const KIND: &'static str = "menu";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// menu the resource is listed under
    #[serde(default)]
    pub menu: String,
}

impl Spec for ResourceSpec {
    const KIND: &'static str = "resource";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// resource name
    pub resource: String,
    /// operation name as it appears in projections
    pub action: String,
    /// granted to every owner of a business group
    #[serde(default)]
    pub owner_grantable: bool,
}

impl Spec for OperationSpec {
    const KIND: &'static str = "operation";
}

/// Effective permissions of one account, stored under the account's name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    /// account uid
    pub account: String,
    #[serde(default)]
    pub menus: BTreeSet<String>,
    /// resource name -> operation names
    #[serde(default)]
    pub resources: BTreeMap<String, BTreeSet<String>>,
}

impl Spec for PermissionSpec {
    const KIND: &'static str = "permission";
}

impl PermissionSpec {
    pub fn allows(&self, resource: &str, op: &str) -> bool {
        self.resources.get(resource).map(|ops| ops.contains(op)).unwrap_or(false)
    }
}
