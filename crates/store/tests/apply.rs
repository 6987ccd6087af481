use std::sync::Arc;

use nimbus_core::{CoderRegistry, Filter, Object, Origin, Spec, Version};
use nimbus_store::{ApplyOptions, ObjectStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Workload {
    image: String,
    #[serde(default)]
    replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}
impl Spec for Workload {
    const KIND: &'static str = "workload";
}

fn store() -> ObjectStore {
    let coders = Arc::new(CoderRegistry::new());
    coders.register::<Workload>();
    ObjectStore::in_memory(coders).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_applies_never_fork_versions() {
    let s = store();
    s.apply_typed("t1", Object::new("w", Workload { image: "a".into(), ..Default::default() }), &ApplyOptions::new())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 1..=8u32 {
        let s = s.clone();
        tasks.push(tokio::spawn(async move {
            let obj = Object::new("w", Workload { image: "a".into(), replicas: i, status: None });
            s.apply_typed("t1", obj, &ApplyOptions::new()).await.unwrap()
        }));
    }
    let mut versions = Vec::new();
    for t in tasks {
        let applied = t.await.unwrap();
        assert!(applied.changed);
        versions.push(applied.object.metadata.version.get());
    }
    versions.sort_unstable();
    assert_eq!(versions, (2..=9).collect::<Vec<u64>>());
    let stored = s.get_typed::<Workload>("t1", "w", None).await.unwrap();
    assert_eq!(stored.metadata.version, Version::new(9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_written_by_south_survives_a_north_spec_update() {
    let s = store();
    let base = Object::new("w", Workload { image: "a".into(), replicas: 1, status: None });
    s.apply_typed("t1", base, &ApplyOptions::new()).await.unwrap();

    let observed = Object::new("w", Workload { image: "a".into(), replicas: 1, status: Some("RUNNING".into()) });
    let south = s.apply_typed("t1", observed, &ApplyOptions::new().origin(Origin::South)).await.unwrap();
    assert_eq!(south.object.metadata.origin, Origin::South);

    // a client that never saw the status field only sends image
    let raw = nimbus_core::RawObject::raw("workload", "w", serde_json::json!({ "image": "b" }));
    let north = s.apply("t1", "workload", "w", raw, &ApplyOptions::new()).await.unwrap();
    assert!(north.changed);
    let typed: Object<Workload> = Object::from_raw(north.object).unwrap();
    assert_eq!(typed.spec, Workload { image: "b".into(), replicas: 1, status: Some("RUNNING".into()) });
    assert_eq!(typed.metadata.origin, Origin::Api);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workspaces_scope_names() {
    let s = store();
    let a = Object::new("w", Workload { image: "a".into(), ..Default::default() }).with_workspace("ws-a");
    let b = Object::new("w", Workload { image: "b".into(), ..Default::default() }).with_workspace("ws-b");
    s.create_typed("t1", a).await.unwrap();
    s.create_typed("t1", b).await.unwrap();

    let only_b = s.list_to_object::<Workload>("t1", &Filter::new().workspace("ws-b")).await.unwrap();
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].spec.image, "b");
    assert_eq!(s.list_to_object::<Workload>("t1", &Filter::new().name("w")).await.unwrap().len(), 2);

    s.delete("t1", "workload", "w", Some("ws-a")).await.unwrap();
    let left = s.list_to_object::<Workload>("t1", &Filter::new()).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].metadata.workspace, "ws-b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_merge_paths_are_rejected() {
    let s = store();
    s.apply_typed("t1", Object::new("w", Workload::default()), &ApplyOptions::new()).await.unwrap();
    let err = s
        .apply_typed("t1", Object::new("w", Workload::default()), &ApplyOptions::new().path("metadata.uid"))
        .await
        .unwrap_err();
    assert!(matches!(err, nimbus_core::Error::Invalid(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_keeps_stored_identity_whatever_uid_is_sent() {
    let s = store();
    let first = s.apply_typed("t1", Object::new("w", Workload { image: "a".into(), ..Default::default() }), &ApplyOptions::new()).await.unwrap();
    let second = s.apply_typed("t1", Object::new("w", Workload { image: "b".into(), ..Default::default() }), &ApplyOptions::new()).await.unwrap();
    assert_eq!(second.object.metadata.version, Version::new(2));

    let mut stray = Object::new("w", Workload { image: "c".into(), ..Default::default() });
    stray.metadata.uid = "other-uid".into();
    let third = s.apply_typed("t1", stray, &ApplyOptions::new()).await.unwrap();
    assert!(third.changed);
    assert_eq!(third.object.metadata.version, Version::new(3));
    assert_eq!(third.object.metadata.uid, first.object.metadata.uid);

    let stored = s.get_typed::<Workload>("t1", "w", None).await.unwrap();
    assert_eq!(stored.metadata.uid, first.object.metadata.uid);
    assert_eq!(stored.metadata.version, Version::new(3));
    assert_eq!(stored.spec.image, "c");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_only_apply_never_inserts() {
    let s = store();
    let opts = ApplyOptions::new().existing_only();
    let err = s.apply_typed("t1", Object::new("w", Workload::default()), &opts).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(s.list("t1", "workload", &Filter::new().include_deleted()).await.unwrap().is_empty());

    s.create_typed("t1", Object::new("w", Workload::default())).await.unwrap();
    let applied = s.apply_typed("t1", Object::new("w", Workload { replicas: 2, ..Default::default() }), &opts).await.unwrap();
    assert_eq!(applied.object.metadata.version, Version::new(2));

    s.tombstone("t1", "workload", "w", None).await.unwrap();
    let err = s.apply_typed("t1", Object::new("w", Workload { replicas: 3, ..Default::default() }), &opts).await.unwrap_err();
    assert!(err.is_not_found(), "tombstoned objects count as gone: {err}");
}
