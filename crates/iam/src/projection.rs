//! Effective permissions of an account.
//!
//! For every group the account belongs to: the roles granted to it in that
//! group, plus every owner-grantable operation when the account owns the
//! group. Role trees resolve through the menu/resource/operation catalogue
//! to `{resource name: {action}}`; menus are closed over their parent chain.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use nimbus_core::relation::role;
use nimbus_core::{Error, Filter, Object, Origin, RelationKind, Spec};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::graph::PermissionGraph;
use crate::kinds::{AccountSpec, BusinessGroupSpec, MenuSpec, OperationSpec, PermissionSpec, ResourceSpec, RoleSpec};

/// Display names of catalogue entries by uid (and, for operations, by name).
/// Identifiers without an entry are taken to be names already.
#[derive(Debug, Default)]
pub(crate) struct Catalogue {
    menus: FxHashMap<String, String>,
    resources: FxHashMap<String, String>,
    ops: FxHashMap<String, String>,
}

impl Catalogue {
    fn lookup<'a>(map: &'a FxHashMap<String, String>, id: &'a str) -> &'a str {
        map.get(id).map(String::as_str).unwrap_or(id)
    }

    pub(crate) fn menu<'a>(&'a self, id: &'a str) -> &'a str {
        Self::lookup(&self.menus, id)
    }

    pub(crate) fn resource<'a>(&'a self, id: &'a str) -> &'a str {
        Self::lookup(&self.resources, id)
    }

    /// Operation uid or document name -> its action.
    pub(crate) fn op<'a>(&'a self, id: &'a str) -> &'a str {
        Self::lookup(&self.ops, id)
    }
}

impl PermissionGraph {
    /// Compute the projection of `account` from the current edges.
    pub async fn project(&self, account: &Object<AccountSpec>) -> Result<PermissionSpec> {
        let uid = account.uid();
        let mut out = PermissionSpec { account: uid.to_string(), ..Default::default() };

        let groups = Self::targets(&self.edges(Some(RelationKind::AccountBusinessGroup), &[(role::ACCOUNT, uid)]).await?, role::BUSINESS_GROUP);
        let mut granted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in self.edges(Some(RelationKind::AccountRole), &[(role::ACCOUNT, uid)]).await? {
            if let (Some(g), Some(r)) = (edge.spec.get(role::BUSINESS_GROUP), edge.spec.get(role::ROLE)) {
                granted.entry(g.to_string()).or_default().insert(r.to_string());
            }
        }

        let mut roles = BTreeSet::new();
        let mut owner = false;
        for g in &groups {
            let Some(group) = self.by_uid::<BusinessGroupSpec>(g).await? else { continue };
            owner |= group.spec.owners.contains(uid);
            if let Some(wanted) = granted.get(g) {
                roles.extend(wanted.iter().cloned());
            }
        }

        let catalogue = self.catalogue().await?;
        for r in &roles {
            let Some(role) = self.by_uid::<RoleSpec>(r).await? else { continue };
            for (menu, resources) in &role.spec.tree {
                out.menus.insert(catalogue.menu(menu).to_string());
                for (resource, ops) in resources {
                    let actions = out.resources.entry(catalogue.resource(resource).to_string()).or_default();
                    actions.extend(ops.iter().map(|op| catalogue.op(op).to_string()));
                }
            }
        }
        if owner {
            self.grant_owner_ops(&mut out).await?;
        }
        self.close_menus(&mut out.menus).await?;
        Ok(out)
    }

    pub(crate) async fn catalogue(&self) -> Result<Catalogue> {
        let mut c = Catalogue::default();
        let all = Filter::new();
        for m in self.store.list_to_object::<MenuSpec>(&self.db, &all).await? {
            c.menus.insert(m.uid().to_string(), m.name().to_string());
        }
        for r in self.store.list_to_object::<ResourceSpec>(&self.db, &all).await? {
            c.resources.insert(r.uid().to_string(), r.name().to_string());
        }
        for o in self.store.list_to_object::<OperationSpec>(&self.db, &all).await? {
            c.ops.insert(o.uid().to_string(), o.spec.action.clone());
            c.ops.insert(o.name().to_string(), o.spec.action);
        }
        Ok(c)
    }

    async fn grant_owner_ops(&self, out: &mut PermissionSpec) -> Result<()> {
        let filter = Filter::new().field("spec.owner_grantable", true);
        for op in self.store.list_to_object::<OperationSpec>(&self.db, &filter).await? {
            match self.store.get_typed::<ResourceSpec>(&self.db, &op.spec.resource, None).await {
                Ok(res) if !res.spec.menu.is_empty() => {
                    out.menus.insert(res.spec.menu);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            out.resources.entry(op.spec.resource).or_default().insert(op.spec.action);
        }
        Ok(())
    }

    /// Add every ancestor of the given menus. Unknown menus end their chain.
    async fn close_menus(&self, menus: &mut BTreeSet<String>) -> Result<()> {
        let mut pending: Vec<String> = menus.iter().cloned().collect();
        while let Some(name) = pending.pop() {
            let menu = match self.store.get_typed::<MenuSpec>(&self.db, &name, None).await {
                Ok(m) => m,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let parent = menu.spec.parent;
            if !parent.is_empty() && menus.insert(parent.clone()) {
                pending.push(parent);
            }
        }
        Ok(())
    }

    /// Recompute and persist the projection of the account with `uid`, or
    /// drop it when the account is gone. Rewrites are delete-then-recreate
    /// and skipped when nothing changed.
    pub async fn recompute(&self, uid: &str) -> Result<Option<PermissionSpec>> {
        let _guard = self.projections.lock().await;
        let started = Instant::now();
        let stored = self.store.list_to_object::<PermissionSpec>(&self.db, &Filter::new().field("spec.account", uid)).await?;

        let Some(account) = self.by_uid::<AccountSpec>(uid).await? else {
            for p in stored {
                self.remove_projection(p.name()).await?;
            }
            debug!(account = uid, "projection dropped");
            return Ok(None);
        };

        let next = self.project(&account).await?;
        let current = stored.iter().find(|p| p.name() == account.name());
        if current.map(|p| p.spec == next).unwrap_or(false) && stored.len() == 1 {
            counter!("iam_projection_total", 1u64, "result" => "unchanged");
            return Ok(Some(next));
        }
        for p in &stored {
            self.remove_projection(p.name()).await?;
        }
        if current.is_none() {
            // a leftover projection may hold the name under an earlier account uid
            self.remove_projection(account.name()).await?;
        }
        let mut obj = Object::new(account.name(), next.clone());
        obj.metadata.origin = Origin::North;
        self.store.create_typed(&self.db, obj).await?;
        counter!("iam_projection_total", 1u64, "result" => "rewritten");
        histogram!("iam_projection_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(account = %account.name(), resources = next.resources.len(), menus = next.menus.len(), "projection rewritten");
        Ok(Some(next))
    }

    async fn remove_projection(&self, name: &str) -> Result<()> {
        match self.store.delete(&self.db, PermissionSpec::KIND, name, None).await {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The stored projection of an account, if any.
    pub async fn permissions(&self, account: &str) -> Result<Option<PermissionSpec>> {
        match self.store.get_typed::<PermissionSpec>(&self.db, account, None).await {
            Ok(p) => Ok(Some(p.spec)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
