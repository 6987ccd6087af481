use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use nimbus_bridge::Bridge;
use nimbus_core::relation::role;
use nimbus_core::{CoderRegistry, Object, RelationKind, Spec};
use nimbus_iam::{
    AccountSpec, BusinessGroupSpec, EdgeDiff, MenuSpec, OperationSpec, PermissionGraph, PermissionSpec, ResourceSpec,
    RoleSpec,
};
use nimbus_kubehub::{ClusterRegistry, KubeconfigBuilder};
use nimbus_store::{ApplyOptions, ObjectStore};
use nimbus_tenancy::WorkspaceSpec;
use tokio_util::sync::CancellationToken;

const DB: &str = "t1";

fn store() -> ObjectStore {
    let coders = Arc::new(CoderRegistry::new());
    nimbus_iam::register_kinds(&coders);
    ObjectStore::in_memory(coders).unwrap()
}

fn set<T: AsRef<str>>(items: &[T]) -> BTreeSet<String> {
    items.iter().map(|s| s.as_ref().to_string()).collect()
}

/// A role granting `ops` on `resource` under `menu`.
async fn role(s: &ObjectStore, name: &str, menu: &str, resource: &str, ops: &[&str]) -> String {
    let tree = BTreeMap::from([(menu.to_string(), BTreeMap::from([(resource.to_string(), ops.iter().map(|o| o.to_string()).collect())]))]);
    s.create_typed(DB, Object::new(name, RoleSpec { tree })).await.unwrap().uid().to_string()
}

async fn account(s: &ObjectStore, name: &str) -> String {
    s.create_typed(DB, Object::new(name, AccountSpec::default())).await.unwrap().uid().to_string()
}

/// Grant `roles` in `group`, replacing what the account held there.
async fn grant(s: &ObjectStore, name: &str, group: &str, roles: &[&String]) -> Object<AccountSpec> {
    let spec = AccountSpec { grants: BTreeMap::from([(group.to_string(), set(roles))]), ..Default::default() };
    s.apply_typed(DB, Object::new(name, spec), &ApplyOptions::new()).await.unwrap().object
}

async fn edge_roles(g: &PermissionGraph, account: &str) -> BTreeSet<String> {
    let edges = g.edges(Some(RelationKind::AccountRole), &[(role::ACCOUNT, account)]).await.unwrap();
    edges.iter().filter_map(|e| e.spec.get(role::ROLE)).map(str::to_string).collect()
}

async fn catalogue(s: &ObjectStore) {
    for (name, parent) in [("platform", ""), ("compute", "platform")] {
        s.create_typed(DB, Object::new(name, MenuSpec { parent: parent.into() })).await.unwrap();
    }
    s.create_typed(DB, Object::new("workspace", ResourceSpec { menu: "platform".into() })).await.unwrap();
    let op = OperationSpec { resource: "workspace".into(), action: "manage".into(), owner_grantable: true };
    s.create_typed(DB, Object::new("workspace-manage", op)).await.unwrap();
    let op = OperationSpec { resource: "workspace".into(), action: "purge".into(), owner_grantable: false };
    s.create_typed(DB, Object::new("workspace-purge", op)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn account_role_edges_converge_on_grants() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (r1, r2, r3) = (
        role(&s, "r1", "compute", "vm", &["get"]).await,
        role(&s, "r2", "compute", "vm", &["list"]).await,
        role(&s, "r3", "compute", "disk", &["get"]).await,
    );
    let a = account(&s, "alice").await;
    let g1 = s.create_typed(DB, Object::new("g1", BusinessGroupSpec::default())).await.unwrap();
    let g1 = g1.uid();

    let acc = grant(&s, "alice", g1, &[&r1, &r2]).await;
    assert_eq!(g.account_changed(&acc).await.unwrap(), EdgeDiff { created: 2, removed: 0 });
    assert_eq!(edge_roles(&g, &a).await, set(&[&r1, &r2]));

    let acc = grant(&s, "alice", g1, &[&r2, &r3]).await;
    assert_eq!(g.account_changed(&acc).await.unwrap(), EdgeDiff { created: 1, removed: 1 });
    assert_eq!(edge_roles(&g, &a).await, set(&[&r2, &r3]));

    // level-triggered: replaying the same state changes nothing
    assert_eq!(g.account_changed(&acc).await.unwrap(), EdgeDiff::default());
    let all = g.edges(Some(RelationKind::AccountRole), &[]).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|e| e.spec.get(role::BUSINESS_GROUP) == Some(g1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn account_replay_does_not_link_deleted_roles() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, _, member, r1) = scenario(&s).await;
    let acc = grant(&s, "mark", bg.uid(), &[&r1]).await;
    g.account_changed(&acc).await.unwrap();
    assert_eq!(edge_roles(&g, &member).await, set(&[&r1]));

    s.delete(DB, RoleSpec::KIND, "viewer", None).await.unwrap();
    g.role_deleted(&r1).await.unwrap();
    assert!(edge_roles(&g, &member).await.is_empty());

    // the account still names the role in its grants
    assert_eq!(g.account_changed(&acc).await.unwrap(), EdgeDiff::default());
    assert!(g.edges(None, &[(role::ROLE, &r1)]).await.unwrap().is_empty());

    s.delete(DB, BusinessGroupSpec::KIND, "bg1", None).await.unwrap();
    g.group_deleted(bg.uid()).await.unwrap();
    let r2 = role(&s, "editor", "compute", "vm", &["update"]).await;
    let acc = grant(&s, "mark", bg.uid(), &[&r2]).await;
    assert_eq!(g.account_changed(&acc).await.unwrap(), EdgeDiff::default(), "grants in a deleted group stay unlinked");
}

/// Two members, one owner; returns (group, owner, member, role) uids.
async fn scenario(s: &ObjectStore) -> (Object<BusinessGroupSpec>, String, String, String) {
    catalogue(s).await;
    let r1 = role(s, "viewer", "compute", "vm", &["get", "list"]).await;
    let owner = account(s, "olga").await;
    let member = account(s, "mark").await;
    let spec = BusinessGroupSpec {
        owners: set(&[&owner]),
        members: set(&[&member]),
        roles: set(&[&r1]),
        cluster: "c1".into(),
    };
    let bg = s.create_typed(DB, Object::new("bg1", spec)).await.unwrap();
    (bg, owner, member, r1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn projection_is_independent_of_reaction_order() {
    let mut results = Vec::new();
    for group_first in [true, false] {
        let s = store();
        let g = PermissionGraph::new(s.clone(), DB);
        let (bg, _, _, r1) = scenario(&s).await;
        let acc = grant(&s, "mark", bg.uid(), &[&r1]).await;
        if group_first {
            g.group_changed(&bg).await.unwrap();
            g.account_changed(&acc).await.unwrap();
        } else {
            g.account_changed(&acc).await.unwrap();
            g.group_changed(&bg).await.unwrap();
        }
        results.push((g.permissions("mark").await.unwrap().unwrap(), g.permissions("olga").await.unwrap().unwrap()));
    }
    assert_eq!(results[0].0.resources, results[1].0.resources);
    assert_eq!(results[0].1.resources, results[1].1.resources);

    let (member, owner) = &results[0];
    assert!(member.allows("vm", "get") && member.allows("vm", "list"));
    assert!(!member.allows("workspace", "manage"));
    assert_eq!(member.menus, set(&["compute", "platform"]));
    // owners get owner-grantable operations only, and no role they were not granted
    assert!(owner.allows("workspace", "manage"));
    assert!(!owner.allows("workspace", "purge"));
    assert!(!owner.allows("vm", "get"));
    assert_eq!(owner.menus, set(&["platform"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn roles_count_in_groups_the_account_belongs_to() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, _, member, _) = scenario(&s).await;
    let unoffered = role(&s, "admin", "compute", "vm", &["delete"]).await;
    let other = s.create_typed(DB, Object::new("bg2", BusinessGroupSpec::default())).await.unwrap();
    let elsewhere = role(&s, "auditor", "compute", "disk", &["get"]).await;
    grant(&s, "mark", bg.uid(), &[&unoffered]).await;
    let acc = grant(&s, "mark", other.uid(), &[&elsewhere]).await;
    g.group_changed(&bg).await.unwrap();
    g.group_changed(&other).await.unwrap();
    g.account_changed(&acc).await.unwrap();

    assert_eq!(edge_roles(&g, &member).await, set(&[&unoffered, &elsewhere]));
    let p = g.permissions("mark").await.unwrap().unwrap();
    // granted in bg1 without bg1 offering it
    assert!(p.allows("vm", "delete"));
    // mark is not a member of bg2
    assert!(!p.allows("disk", "get"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn role_trees_resolve_catalogue_uids_to_names() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, _, _, _) = scenario(&s).await;
    let menu = s.get_typed::<MenuSpec>(DB, "compute", None).await.unwrap();
    let res = s.get_typed::<ResourceSpec>(DB, "workspace", None).await.unwrap();
    let purge = s.get_typed::<OperationSpec>(DB, "workspace-purge", None).await.unwrap();
    let tree = BTreeMap::from([(menu.uid().to_string(), BTreeMap::from([(res.uid().to_string(), vec![purge.uid().to_string()])]))]);
    let purger = s.create_typed(DB, Object::new("purger", RoleSpec { tree })).await.unwrap();

    let acc = grant(&s, "mark", bg.uid(), &[&purger.uid().to_string()]).await;
    g.group_changed(&bg).await.unwrap();
    g.account_changed(&acc).await.unwrap();

    let p = g.permissions("mark").await.unwrap().unwrap();
    assert!(p.allows("workspace", "purge"));
    assert_eq!(p.menus, set(&["compute", "platform"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn role_change_reaches_group_members() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, _, _, r1) = scenario(&s).await;
    let acc = grant(&s, "mark", bg.uid(), &[&r1]).await;
    g.group_changed(&bg).await.unwrap();
    g.account_changed(&acc).await.unwrap();
    assert!(!g.permissions("mark").await.unwrap().unwrap().allows("disk", "get"));

    let tree = BTreeMap::from([("compute".to_string(), BTreeMap::from([("disk".to_string(), vec!["get".to_string()])]))]);
    let applied = s.apply_typed(DB, Object::new("viewer", RoleSpec { tree }), &ApplyOptions::new()).await.unwrap();
    assert!(applied.changed);
    g.role_changed(&r1).await.unwrap();
    let p = g.permissions("mark").await.unwrap().unwrap();
    // maps merge key-wise, so the vm subtree is still there
    assert!(p.allows("disk", "get") && p.allows("vm", "get"));

    s.delete(DB, RoleSpec::KIND, "viewer", None).await.unwrap();
    g.role_deleted(&r1).await.unwrap();
    assert!(g.permissions("mark").await.unwrap().unwrap().resources.is_empty());
    assert!(g.edges(None, &[(role::ROLE, &r1)]).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_business_group_cascades() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, owner, member, r1) = scenario(&s).await;
    let acc = grant(&s, "mark", bg.uid(), &[&r1]).await;
    g.group_changed(&bg).await.unwrap();
    g.account_changed(&acc).await.unwrap();

    let ws = s.get_typed::<WorkspaceSpec>(DB, "bg1", None).await.unwrap();
    assert_eq!(ws.spec.business_group, bg.uid());
    assert_eq!(ws.spec.cluster, "c1");
    let members = g.edges(Some(RelationKind::AccountBusinessGroup), &[(role::BUSINESS_GROUP, bg.uid())]).await.unwrap();
    assert_eq!(members.len(), 2);

    s.delete(DB, BusinessGroupSpec::KIND, "bg1", None).await.unwrap();
    g.group_deleted(bg.uid()).await.unwrap();

    let left = g.edges(Some(RelationKind::AccountBusinessGroup), &[(role::BUSINESS_GROUP, bg.uid())]).await.unwrap();
    assert!(left.is_empty());
    assert!(g.edges(None, &[(role::BUSINESS_GROUP, bg.uid())]).await.unwrap().is_empty());
    assert!(s.get(DB, WorkspaceSpec::KIND, "bg1", None).await.unwrap_err().is_not_found());
    for (name, uid) in [("olga", &owner), ("mark", &member)] {
        let p = g.permissions(name).await.unwrap().unwrap();
        assert_eq!(&p.account, uid);
        assert!(p.resources.is_empty() && p.menus.is_empty(), "{name} kept {p:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_an_account_drops_edges_and_projection() {
    let s = store();
    let g = PermissionGraph::new(s.clone(), DB);
    let (bg, _, member, r1) = scenario(&s).await;
    let acc = grant(&s, "mark", bg.uid(), &[&r1]).await;
    g.group_changed(&bg).await.unwrap();
    g.account_changed(&acc).await.unwrap();

    s.delete(DB, AccountSpec::KIND, "mark", None).await.unwrap();
    g.account_deleted(&member).await.unwrap();
    assert!(g.edges(None, &[(role::ACCOUNT, &member)]).await.unwrap().is_empty());
    assert_eq!(g.permissions("mark").await.unwrap(), None);

    // the group still lists the account, but a replay does not resurrect its edge
    g.group_changed(&bg).await.unwrap();
    assert!(g.edges(None, &[(role::ACCOUNT, &member)]).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bridge_drives_the_graph() {
    let s = store();
    let clusters = Arc::new(ClusterRegistry::new(Arc::new(KubeconfigBuilder::default())));
    let mut bridge = Bridge::new(s.clone(), clusters, "system");
    bridge.add(nimbus_iam::handlers(DB));
    assert_eq!(bridge.len(), 3);
    let ctx = CancellationToken::new();
    let handle = bridge.run(&ctx).await.unwrap();

    let (bg, _, _, r1) = scenario(&s).await;
    grant(&s, "mark", bg.uid(), &[&r1]).await;

    let g = PermissionGraph::new(s.clone(), DB);
    let mut seen: Option<PermissionSpec> = None;
    for _ in 0..300 {
        seen = g.permissions("mark").await.unwrap();
        if seen.as_ref().map(|p| p.allows("vm", "list")).unwrap_or(false) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen.unwrap().allows("vm", "list"));

    ctx.cancel();
    let summaries = tokio::time::timeout(Duration::from_secs(3), handle.wait()).await.unwrap();
    assert_eq!(summaries.len(), 3);
}
