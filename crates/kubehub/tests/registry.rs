use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::{CoderRegistry, Object};
use nimbus_kubehub::{register_kinds, ClientBuilder, ClusterChange, ClusterRegistry, ClusterSpec, KubeconfigBuilder};
use nimbus_store::{ApplyOptions, ObjectStore};
use tokio_util::sync::CancellationToken;

fn kubeconfig(server: &str) -> String {
    format!(
        "apiVersion: v1
kind: Config
clusters:
- name: c
  cluster:
    server: {server}
contexts:
- name: c
  context:
    cluster: c
    user: u
current-context: c
users:
- name: u
  user:
    token: t
"
    )
}

fn store() -> ObjectStore {
    let coders = Arc::new(CoderRegistry::new());
    register_kinds(&coders);
    ObjectStore::in_memory(coders).unwrap()
}

#[derive(Default)]
struct CountingBuilder {
    inner: KubeconfigBuilder,
    builds: AtomicUsize,
}

#[async_trait]
impl ClientBuilder for CountingBuilder {
    async fn build(&self, cluster: &Object<ClusterSpec>) -> anyhow::Result<kube::Client> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inner.build(cluster).await
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptor_lifecycle_drives_membership() {
    let s = store();
    let reg = Arc::new(ClusterRegistry::new(Arc::new(KubeconfigBuilder::default())));
    let mut changes = reg.subscribe();
    let ctx = CancellationToken::new();
    let _task = reg.start(&ctx, s.clone(), "system").await.unwrap();
    assert!(reg.is_empty());

    let c1 = Object::new("c1", ClusterSpec { config: kubeconfig("http://127.0.0.1:1") });
    s.create_typed("system", c1).await.unwrap();
    assert!(eventually(|| reg.get("c1").is_some()).await, "client never registered");
    let first = reg.get("c1").unwrap();
    assert!(matches!(changes.recv().await.unwrap(), ClusterChange::Added(c) if c.name() == "c1"));

    // a config change rebuilds and stops the old client
    let c1b = Object::new("c1", ClusterSpec { config: kubeconfig("http://127.0.0.1:2") });
    s.apply_typed("system", c1b, &ApplyOptions::new()).await.unwrap();
    assert!(eventually(|| reg.get("c1").map(|c| !Arc::ptr_eq(&c, &first)).unwrap_or(false)).await);
    assert!(first.is_stopped());
    let second = reg.get("c1").unwrap();

    s.delete("system", "cluster", "c1", None).await.unwrap();
    assert!(eventually(|| reg.get("c1").is_none()).await, "client never evicted");
    assert!(second.is_stopped());
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_skips_bad_configs_and_watch_does_not_rebuild() {
    let s = store();
    s.create_typed("system", Object::new("good", ClusterSpec { config: kubeconfig("http://127.0.0.1:1") })).await.unwrap();
    s.create_typed("system", Object::new("bad", ClusterSpec { config: "::: not a kubeconfig".into() })).await.unwrap();

    let builder = Arc::new(CountingBuilder::default());
    let reg = Arc::new(ClusterRegistry::new(builder.clone()));
    assert_eq!(reg.bootstrap(&s, "system").await.unwrap(), 1);
    assert!(reg.get("bad").is_none());
    let builds_after_bootstrap = builder.builds.load(Ordering::SeqCst);

    // the snapshot pass replays "good" at the same revision
    let ctx = CancellationToken::new();
    let _task = reg.spawn_watch(&ctx, s.clone(), "system");
    tokio::time::sleep(Duration::from_millis(100)).await;
    // only the bad descriptor is retried
    assert_eq!(builder.builds.load(Ordering::SeqCst), builds_after_bootstrap + 1);
    assert_eq!(reg.len(), 1);
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_every_client() {
    let s = store();
    s.create_typed("system", Object::new("a", ClusterSpec { config: kubeconfig("http://127.0.0.1:1") })).await.unwrap();
    s.create_typed("system", Object::new("b", ClusterSpec { config: kubeconfig("http://127.0.0.1:2") })).await.unwrap();
    let reg = Arc::new(ClusterRegistry::new(Arc::new(KubeconfigBuilder::default())));
    let ctx = CancellationToken::new();
    let task = reg.start(&ctx, s, "system").await.unwrap();
    let clients = reg.clients();
    assert_eq!(clients.iter().map(|c| c.name()).collect::<Vec<_>>(), vec!["a", "b"]);

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(clients.iter().all(|c| c.is_stopped()));
    assert!(reg.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn descriptors_deleted_before_the_watch_opens_are_evicted() {
    let s = store();
    s.create_typed("system", Object::new("keep", ClusterSpec { config: kubeconfig("http://127.0.0.1:1") })).await.unwrap();
    s.create_typed("system", Object::new("drop", ClusterSpec { config: kubeconfig("http://127.0.0.1:2") })).await.unwrap();
    let reg = Arc::new(ClusterRegistry::new(Arc::new(KubeconfigBuilder::default())));
    assert_eq!(reg.bootstrap(&s, "system").await.unwrap(), 2);
    let dropped = reg.get("drop").unwrap();
    let mut changes = reg.subscribe();

    // deleted while nothing follows the collection
    s.delete("system", "cluster", "drop", None).await.unwrap();
    let ctx = CancellationToken::new();
    let _task = reg.spawn_watch(&ctx, s.clone(), "system");

    assert!(eventually(|| reg.get("drop").is_none()).await, "stale client kept");
    assert!(dropped.is_stopped());
    assert!(reg.get("keep").is_some());
    assert!(matches!(changes.recv().await.unwrap(), ClusterChange::Removed(n) if n == "drop"));
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_evicts_clients_without_a_descriptor() {
    let s = store();
    s.create_typed("system", Object::new("a", ClusterSpec { config: kubeconfig("http://127.0.0.1:1") })).await.unwrap();
    let reg = ClusterRegistry::new(Arc::new(KubeconfigBuilder::default()));
    let orphan = reg.upsert(&Object::new("orphan", ClusterSpec { config: kubeconfig("http://127.0.0.1:2") })).await.unwrap();

    assert_eq!(reg.bootstrap(&s, "system").await.unwrap(), 1);
    assert!(reg.get("orphan").is_none());
    assert!(orphan.is_stopped());
    assert_eq!(reg.prune(&s, "system").await.unwrap(), 0);
}
