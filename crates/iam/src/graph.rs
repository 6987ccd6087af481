//! Relation edges and the reactions to account, business-group and role
//! changes.
//!
//! Every reaction first brings the edges in line with the mutated object
//! (set reconciliation keyed by the edge's target uids), then recomputes the
//! projection of each account whose edges could have changed.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use metrics::counter;
use nimbus_core::relation::role;
use nimbus_core::{Error, Filter, Object, Origin, Phase, RelationKind, RelationSpec, Spec};
use nimbus_store::{ApplyOptions, ObjectStore};
use nimbus_tenancy::{WorkspaceSpec, LIFECYCLE};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kinds::{AccountSpec, BusinessGroupSpec, RoleSpec};

type Edge = Object<RelationSpec>;

/// Counts from one edge reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeDiff {
    pub created: usize,
    pub removed: usize,
}

#[derive(Clone)]
pub struct PermissionGraph {
    pub(crate) store: ObjectStore,
    pub(crate) db: String,
    /// serializes projection rewrites across handlers
    pub(crate) projections: Arc<Mutex<()>>,
}

impl PermissionGraph {
    pub fn new(store: ObjectStore, db: impl Into<String>) -> Self {
        Self::with_lock(store, db, Arc::new(Mutex::new(())))
    }

    pub fn with_lock(store: ObjectStore, db: impl Into<String>, projections: Arc<Mutex<()>>) -> Self {
        Self { store, db: db.into(), projections }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    // ---- edges ----

    /// Edges of `kind` (any kind when `None`) whose roles point at the given uids.
    pub async fn edges(&self, kind: Option<RelationKind>, by: &[(&str, &str)]) -> Result<Vec<Edge>> {
        let mut filter = Filter::new();
        if let Some(kind) = kind {
            filter = filter.field("spec.relation_kind", kind.as_str());
        }
        for (role, uid) in by {
            filter = filter.field(RelationSpec::path(role), *uid);
        }
        Ok(self.store.list_to_object::<RelationSpec>(&self.db, &filter).await?)
    }

    /// Uids found under `role` across `edges`.
    pub(crate) fn targets(edges: &[Edge], role: &str) -> BTreeSet<String> {
        edges.iter().filter_map(|e| e.spec.get(role)).map(str::to_string).collect()
    }

    /// Create the desired edges that are missing and remove the rest.
    pub async fn reconcile_edges(&self, existing: Vec<Edge>, desired: Vec<RelationSpec>) -> Result<EdgeDiff> {
        let mut have: FxHashMap<String, Edge> = existing.into_iter().map(|e| (e.spec.edge_name(), e)).collect();
        let mut diff = EdgeDiff::default();
        for spec in desired {
            if have.remove(&spec.edge_name()).is_some() {
                continue;
            }
            let mut edge = spec.into_object();
            edge.metadata.origin = Origin::North;
            match self.store.create_typed(&self.db, edge).await {
                Ok(_) => diff.created += 1,
                Err(Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for (_, stale) in have {
            self.remove_edge(&stale).await?;
            diff.removed += 1;
        }
        if diff != EdgeDiff::default() {
            counter!("iam_edges_created_total", diff.created as u64);
            counter!("iam_edges_removed_total", diff.removed as u64);
        }
        Ok(diff)
    }

    async fn remove_edge(&self, edge: &Edge) -> Result<()> {
        match self.store.delete_by_uid(&self.db, RelationSpec::KIND, edge.uid()).await {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every edge whose `role` is `uid`; returns what was removed.
    pub async fn drop_edges(&self, role: &str, uid: &str) -> Result<Vec<Edge>> {
        let edges = self.edges(None, &[(role, uid)]).await?;
        for e in &edges {
            self.remove_edge(e).await?;
        }
        if !edges.is_empty() {
            counter!("iam_edges_removed_total", edges.len() as u64);
        }
        Ok(edges)
    }

    pub(crate) async fn by_uid<S: Spec>(&self, uid: &str) -> Result<Option<Object<S>>> {
        let mut found = self.store.list_to_object::<S>(&self.db, &Filter::new().uid(uid)).await?;
        Ok(found.pop())
    }

    async fn existing_uids<S: Spec>(&self, uids: impl IntoIterator<Item = &str>) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for uid in uids {
            if self.by_uid::<S>(uid).await?.is_some() {
                out.insert(uid.to_string());
            } else {
                debug!(kind = S::KIND, uid, "reference to missing object ignored");
            }
        }
        Ok(out)
    }

    // ---- reactions ----

    /// ACCOUNTROLE edges follow `spec.grants`; grants naming a missing group
    /// or role are skipped.
    pub async fn account_changed(&self, account: &Object<AccountSpec>) -> Result<EdgeDiff> {
        let uid = account.uid();
        let existing = self.edges(Some(RelationKind::AccountRole), &[(role::ACCOUNT, uid)]).await?;
        let grants = &account.spec.grants;
        let groups = self.existing_uids::<BusinessGroupSpec>(grants.keys().map(String::as_str)).await?;
        let roles = self.existing_uids::<RoleSpec>(grants.values().flatten().map(String::as_str)).await?;
        let mut desired = Vec::new();
        for (group, granted) in grants.iter().filter(|(g, _)| groups.contains(*g)) {
            for r in granted.iter().filter(|r| roles.contains(*r)) {
                desired.push(RelationSpec::new(
                    RelationKind::AccountRole,
                    [(role::ACCOUNT, uid), (role::BUSINESS_GROUP, group.as_str()), (role::ROLE, r.as_str())],
                ));
            }
        }
        let diff = self.reconcile_edges(existing, desired).await?;
        debug!(account = %account.name(), created = diff.created, removed = diff.removed, "account edges reconciled");
        self.recompute(uid).await?;
        Ok(diff)
    }

    pub async fn account_deleted(&self, uid: &str) -> Result<()> {
        let dropped = self.drop_edges(role::ACCOUNT, uid).await?;
        self.recompute(uid).await?;
        info!(account = uid, edges = dropped.len(), "account removed from the permission graph");
        Ok(())
    }

    /// ACCOUNTBUSINESSGROUP edges follow owners and members, BUSINESSGROUPROLE
    /// edges follow roles; references to missing objects are skipped.
    pub async fn group_changed(&self, group: &Object<BusinessGroupSpec>) -> Result<()> {
        let uid = group.uid();
        let existing = self.edges(Some(RelationKind::AccountBusinessGroup), &[(role::BUSINESS_GROUP, uid)]).await?;
        let mut affected = Self::targets(&existing, role::ACCOUNT);
        let accounts = self.existing_uids::<AccountSpec>(group.spec.accounts()).await?;
        let desired = accounts
            .iter()
            .map(|a| RelationSpec::new(RelationKind::AccountBusinessGroup, [(role::ACCOUNT, a.as_str()), (role::BUSINESS_GROUP, uid)]))
            .collect();
        let members = self.reconcile_edges(existing, desired).await?;
        affected.extend(accounts);

        let existing = self.edges(Some(RelationKind::BusinessGroupRole), &[(role::BUSINESS_GROUP, uid)]).await?;
        let roles = self.existing_uids::<RoleSpec>(group.spec.roles.iter().map(String::as_str)).await?;
        let desired = roles
            .iter()
            .map(|r| RelationSpec::new(RelationKind::BusinessGroupRole, [(role::BUSINESS_GROUP, uid), (role::ROLE, r.as_str())]))
            .collect();
        let offered = self.reconcile_edges(existing, desired).await?;
        debug!(group = %group.name(), members = ?members, roles = ?offered, "group edges reconciled");

        self.ensure_workspace(group).await?;
        for account in &affected {
            self.recompute(account).await?;
        }
        Ok(())
    }

    /// Drop every edge referencing the group and its workspace, then
    /// recompute its former members.
    pub async fn group_deleted(&self, uid: &str) -> Result<()> {
        let dropped = self.drop_edges(role::BUSINESS_GROUP, uid).await?;
        let former = Self::targets(&dropped, role::ACCOUNT);
        let filter = Filter::new().field("spec.business_group", uid);
        for ws in self.store.list_to_object::<WorkspaceSpec>(&self.db, &filter).await? {
            match self.store.delete(&self.db, WorkspaceSpec::KIND, ws.name(), None).await {
                Ok(_) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            info!(group = uid, workspace = %ws.name(), "derived workspace removed");
        }
        for account in &former {
            self.recompute(account).await?;
        }
        info!(group = uid, edges = dropped.len(), accounts = former.len(), "business group removed from the permission graph");
        Ok(())
    }

    pub async fn role_changed(&self, uid: &str) -> Result<()> {
        for account in self.role_accounts(uid).await? {
            self.recompute(&account).await?;
        }
        Ok(())
    }

    pub async fn role_deleted(&self, uid: &str) -> Result<()> {
        let accounts = self.role_accounts(uid).await?;
        let dropped = self.drop_edges(role::ROLE, uid).await?;
        for account in &accounts {
            self.recompute(account).await?;
        }
        info!(role = uid, edges = dropped.len(), accounts = accounts.len(), "role removed from the permission graph");
        Ok(())
    }

    /// Accounts holding the role directly, plus members of groups offering it.
    async fn role_accounts(&self, uid: &str) -> Result<BTreeSet<String>> {
        let direct = self.edges(Some(RelationKind::AccountRole), &[(role::ROLE, uid)]).await?;
        let mut accounts = Self::targets(&direct, role::ACCOUNT);
        let offering = self.edges(Some(RelationKind::BusinessGroupRole), &[(role::ROLE, uid)]).await?;
        for group in Self::targets(&offering, role::BUSINESS_GROUP) {
            let members = self.edges(Some(RelationKind::AccountBusinessGroup), &[(role::BUSINESS_GROUP, &group)]).await?;
            accounts.extend(Self::targets(&members, role::ACCOUNT));
        }
        Ok(accounts)
    }

    /// The group's workspace carries its name; a cluster change sends it
    /// back through UPDATE.
    async fn ensure_workspace(&self, group: &Object<BusinessGroupSpec>) -> Result<()> {
        let name = group.name();
        let current = match self.store.get_typed::<WorkspaceSpec>(&self.db, name, None).await {
            Ok(ws) => Some(ws),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let Some(current) = current else {
            let mut ws = Object::new(name, WorkspaceSpec { business_group: group.uid().to_string(), cluster: group.spec.cluster.clone(), ..Default::default() });
            ws.metadata.origin = Origin::North;
            return match self.store.create_typed(&self.db, ws).await {
                Ok(_) | Err(Error::AlreadyExists { .. }) => {
                    info!(group = name, "workspace created for business group");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
        };
        if !current.spec.business_group.is_empty() && current.spec.business_group != group.uid() {
            warn!(group = name, owner = %current.spec.business_group, "workspace name taken by another business group");
            return Ok(());
        }
        if current.spec.business_group == group.uid() && current.spec.cluster == group.spec.cluster {
            return Ok(());
        }
        let mut next = WorkspaceSpec { business_group: group.uid().to_string(), cluster: group.spec.cluster.clone(), ..current.spec.clone() };
        let mut opts = ApplyOptions::new().path("spec.business_group").path("spec.cluster").origin(Origin::North);
        if current.spec.cluster != group.spec.cluster && LIFECYCLE.can_transition(current.spec.status, Phase::Update) {
            next.status = Phase::Update;
            opts = opts.path("spec.status");
        }
        self.store.apply_typed(&self.db, Object::new(name, next), &opts).await?;
        Ok(())
    }
}
