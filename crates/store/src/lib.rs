//! Nimbus object store: versioned CRUD over (database, collection) partitions,
//! path-scoped merge-apply, and the change feed built on the write log.

#![forbid(unsafe_code)]

pub mod feed;
pub mod merge;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use nimbus_core::{new_uid, now_ms, CoderRegistry, Error, Filter, Object, Origin, RawObject, Result, Spec, Version};
use nimbus_persist::{DocKey, DocumentLog, Query, SqliteLog};
use smallvec::SmallVec;
use tokio::sync::{watch, Mutex};
use tracing::debug;

pub use feed::{EventSink, WatchStream};

/// Store tuning, read from `NIMBUS_*` environment variables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Capacity of each watch's event channel.
    pub queue_cap: usize,
    /// Max write-log entries read per tail round trip.
    pub feed_batch: usize,
    pub health_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { queue_cap: 1024, feed_batch: 512, health_interval: Duration::from_secs(5) }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let queue_cap = std::env::var("NIMBUS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap);
        let feed_batch = std::env::var("NIMBUS_FEED_BATCH").ok().and_then(|s| s.parse().ok()).unwrap_or(d.feed_batch);
        let health_interval = std::env::var("NIMBUS_HEALTH_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.health_interval);
        Self { queue_cap: queue_cap.max(1), feed_batch: feed_batch.max(1), health_interval }
    }
}

/// How `apply` merges and records a write.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Persist (and bump the version) even when nothing differs.
    pub force: bool,
    /// Dotted document paths to merge; empty means `["spec"]`.
    pub merge_paths: SmallVec<[String; 2]>,
    /// Origin recorded on the written object; defaults to the incoming one.
    pub origin: Option<Origin>,
    /// Fail with `NotFound` instead of inserting when nothing (or only a
    /// tombstone) is stored under the name.
    pub existing_only: bool,
}

impl ApplyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.merge_paths.push(path.into());
        self
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn existing_only(mut self) -> Self {
        self.existing_only = true;
        self
    }
}

/// Result of `apply`: the object as stored plus whether content changed.
#[derive(Debug, Clone)]
pub struct Applied<T = RawObject> {
    pub object: T,
    /// Content differed from what was stored. False for the initial insert.
    pub changed: bool,
    /// A write reached the log (insert, change, or forced apply).
    pub written: bool,
}

struct Inner {
    log: Arc<dyn DocumentLog>,
    coders: Arc<CoderRegistry>,
    head_tx: watch::Sender<u64>,
    /// Serializes read-modify-write sequences so versions never fork.
    write_lock: Mutex<()>,
    config: StoreConfig,
}

/// Cheap-to-clone handle; all clones share one backend and one coder registry.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<Inner>,
}

impl ObjectStore {
    pub fn with_log(log: Arc<dyn DocumentLog>, coders: Arc<CoderRegistry>, config: StoreConfig) -> Result<Self> {
        let head = log.head().map_err(backend)?;
        let (head_tx, _) = watch::channel(head);
        Ok(Self { inner: Arc::new(Inner { log, coders, head_tx, write_lock: Mutex::new(()), config }) })
    }

    pub fn open(path: &str, coders: Arc<CoderRegistry>, config: StoreConfig) -> Result<Self> {
        let log = SqliteLog::open(path).map_err(backend)?;
        Self::with_log(Arc::new(log), coders, config)
    }

    pub fn in_memory(coders: Arc<CoderRegistry>) -> Result<Self> {
        let log = SqliteLog::open_in_memory().map_err(backend)?;
        Self::with_log(Arc::new(log), coders, StoreConfig::default())
    }

    pub fn coders(&self) -> &Arc<CoderRegistry> {
        &self.inner.coders
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn log(&self) -> &Arc<dyn DocumentLog> {
        &self.inner.log
    }

    pub(crate) fn subscribe_head(&self) -> watch::Receiver<u64> {
        self.inner.head_tx.subscribe()
    }

    fn publish(&self, seq: u64) {
        self.inner.head_tx.send_modify(|h| *h = (*h).max(seq));
    }

    // ---- reads ----

    /// Fetch by name (and workspace when given). Tombstones read as absent.
    pub async fn get(&self, db: &str, collection: &str, name: &str, workspace: Option<&str>) -> Result<RawObject> {
        let mut filter = Filter::new().name(name);
        if let Some(ws) = workspace {
            filter = filter.workspace(ws);
        }
        self.get_by_filter(db, collection, &filter).await.map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found(collection, name),
            other => other,
        })
    }

    pub async fn get_typed<S: Spec>(&self, db: &str, name: &str, workspace: Option<&str>) -> Result<Object<S>> {
        let raw = self.get(db, S::KIND, name, workspace).await?;
        self.inner.coders.decode(raw)
    }

    pub async fn get_by_filter(&self, db: &str, collection: &str, filter: &Filter) -> Result<RawObject> {
        let label = filter.name_value().or(filter.uid_value()).unwrap_or("<filter>").to_string();
        self.list(db, collection, filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(collection, &label))
    }

    pub async fn list(&self, db: &str, collection: &str, filter: &Filter) -> Result<Vec<RawObject>> {
        let q = Query { name: filter.name_value(), workspace: filter.workspace_value(), uid: filter.uid_value() };
        let docs = self.inner.log.find(db, collection, q).map_err(backend)?;
        docs.into_iter().filter(|d| filter.matches(d)).map(RawObject::from_document).collect()
    }

    pub async fn list_to_object<S: Spec>(&self, db: &str, filter: &Filter) -> Result<Vec<Object<S>>> {
        self.list(db, S::KIND, filter).await?.into_iter().map(|raw| self.inner.coders.decode(raw)).collect()
    }

    // ---- writes ----

    /// Insert a new object. Fails for unregistered kinds and existing identities.
    pub async fn create(&self, db: &str, collection: &str, mut obj: RawObject) -> Result<RawObject> {
        self.inner.coders.check(&obj)?;
        if obj.metadata.name.is_empty() {
            return Err(Error::Invalid("object name must not be empty".into()));
        }
        if obj.metadata.uid.is_empty() {
            obj.metadata.uid = new_uid();
        }
        let now = now_ms();
        obj.metadata.version = Version::INITIAL;
        obj.metadata.is_delete = false;
        obj.metadata.created_at = now;
        obj.metadata.updated_at = now;
        let doc = obj.to_document()?;
        let key = doc_key(db, collection, &obj);
        match self.inner.log.insert(key, &obj.metadata.uid, &doc).map_err(backend)? {
            Some(seq) => self.publish(seq),
            None => return Err(Error::AlreadyExists { collection: collection.into(), name: obj.metadata.name }),
        }
        counter!("store_create_total", 1u64, "collection" => collection.to_string());
        debug!(db, collection, name = %obj.metadata.name, "object created");
        Ok(obj)
    }

    pub async fn create_typed<S: Spec>(&self, db: &str, obj: Object<S>) -> Result<Object<S>> {
        let raw = self.create(db, S::KIND, obj.into_raw()?).await?;
        Object::from_raw(raw)
    }

    /// Merge-apply `new` onto the object stored under `name`.
    ///
    /// A missing object is inserted with version 1 and reported as unchanged.
    /// Otherwise only the merge paths (default `spec`) are copied over; when
    /// nothing differs and `force` is off the stored object is returned as is.
    pub async fn apply(
        &self,
        db: &str,
        collection: &str,
        name: &str,
        mut new: RawObject,
        opts: &ApplyOptions,
    ) -> Result<Applied> {
        let started = Instant::now();
        self.inner.coders.check(&new)?;
        new.metadata.name = name.to_string();
        if let Some(origin) = opts.origin {
            new.metadata.origin = origin;
        }

        let _guard = self.inner.write_lock.lock().await;
        // identity is (name, workspace); a caller-supplied uid never selects
        // or replaces the stored document
        let q = Query { name: Some(name), workspace: Some(&new.metadata.workspace), uid: None };
        let existing = self.inner.log.find(db, collection, q).map_err(backend)?.into_iter().next();
        if opts.existing_only && existing.as_ref().map_or(true, is_tombstone) {
            return Err(Error::not_found(collection, name));
        }

        let Some(existing) = existing else {
            let now = now_ms();
            if new.metadata.uid.is_empty() {
                new.metadata.uid = new_uid();
            }
            new.metadata.version = Version::INITIAL;
            new.metadata.is_delete = false;
            new.metadata.created_at = now;
            new.metadata.updated_at = now;
            let doc = new.to_document()?;
            // Upsert rather than insert: a concurrent create simply loses.
            let seq = self.inner.log.upsert(doc_key(db, collection, &new), &new.metadata.uid, &doc).map_err(backend)?;
            self.publish(seq);
            counter!("store_apply_total", 1u64, "result" => "created");
            return Ok(Applied { object: new, changed: false, written: true });
        };

        let mut merged = existing.clone();
        let new_doc = new.to_document()?;
        let changed = if opts.merge_paths.is_empty() {
            merge::merge_paths(&mut merged, &new_doc, merge::DEFAULT_PATHS.iter().copied())?
        } else {
            merge::merge_paths(&mut merged, &new_doc, opts.merge_paths.iter().map(String::as_str))?
        };
        let mut obj = RawObject::from_document(merged)?;
        if !new.metadata.uid.is_empty() && new.metadata.uid != obj.metadata.uid {
            debug!(db, collection, name, "ignoring caller uid on apply");
        }
        if !changed && !opts.force {
            counter!("store_apply_total", 1u64, "result" => "unchanged");
            return Ok(Applied { object: RawObject::from_document(existing)?, changed: false, written: false });
        }
        self.inner.coders.check(&obj)?;
        obj.metadata.version = obj.metadata.version.next();
        obj.metadata.origin = new.metadata.origin;
        obj.metadata.updated_at = now_ms();
        let doc = obj.to_document()?;
        let seq = self.inner.log.upsert(doc_key(db, collection, &obj), &obj.metadata.uid, &doc).map_err(backend)?;
        self.publish(seq);
        counter!("store_apply_total", 1u64, "result" => if changed { "changed" } else { "forced" });
        histogram!("store_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(db, collection, name, version = %obj.metadata.version, changed, "object applied");
        Ok(Applied { object: obj, changed, written: true })
    }

    pub async fn apply_typed<S: Spec>(&self, db: &str, obj: Object<S>, opts: &ApplyOptions) -> Result<Applied<Object<S>>> {
        let name = obj.metadata.name.clone();
        let applied = self.apply(db, S::KIND, &name, obj.into_raw()?, opts).await?;
        Ok(Applied { object: Object::from_raw(applied.object)?, changed: applied.changed, written: applied.written })
    }

    /// Persist the tombstone only. The document stays until removed through
    /// `delete`/`delete_by_uid`.
    pub async fn tombstone(&self, db: &str, collection: &str, name: &str, workspace: Option<&str>) -> Result<RawObject> {
        let q = Query { name: Some(name), workspace, uid: None };
        self.mark_deleted(db, collection, q).await?.ok_or_else(|| Error::not_found(collection, name))
    }

    /// Tombstone then physically remove. Watchers see one DELETED event
    /// carrying the tombstoned object before the document disappears.
    pub async fn delete(&self, db: &str, collection: &str, name: &str, workspace: Option<&str>) -> Result<RawObject> {
        let q = Query { name: Some(name), workspace, uid: None };
        let obj = self.mark_deleted(db, collection, q).await?.ok_or_else(|| Error::not_found(collection, name))?;
        self.remove(db, collection, &obj)?;
        Ok(obj)
    }

    pub async fn delete_by_uid(&self, db: &str, collection: &str, uid: &str) -> Result<RawObject> {
        let q = Query { name: None, workspace: None, uid: Some(uid) };
        let obj = self.mark_deleted(db, collection, q).await?.ok_or_else(|| Error::not_found(collection, uid))?;
        self.remove(db, collection, &obj)?;
        Ok(obj)
    }

    async fn mark_deleted(&self, db: &str, collection: &str, q: Query<'_>) -> Result<Option<RawObject>> {
        let _guard = self.inner.write_lock.lock().await;
        let Some(doc) = self.inner.log.find(db, collection, q).map_err(backend)?.into_iter().next() else {
            return Ok(None);
        };
        let mut obj = RawObject::from_document(doc)?;
        if obj.metadata.is_delete {
            return Ok(Some(obj));
        }
        obj.metadata.is_delete = true;
        obj.metadata.version = obj.metadata.version.next();
        obj.metadata.updated_at = now_ms();
        let doc = obj.to_document()?;
        let seq = self.inner.log.upsert(doc_key(db, collection, &obj), &obj.metadata.uid, &doc).map_err(backend)?;
        self.publish(seq);
        counter!("store_delete_total", 1u64, "collection" => collection.to_string());
        Ok(Some(obj))
    }

    fn remove(&self, db: &str, collection: &str, obj: &RawObject) -> Result<()> {
        let q = Query { name: Some(&obj.metadata.name), workspace: Some(&obj.metadata.workspace), uid: Some(&obj.metadata.uid) };
        if let Some(seq) = self.inner.log.remove(db, collection, q).map_err(backend)? {
            self.publish(seq);
        }
        Ok(())
    }

    /// Keep only the newest `keep` write-log entries. Watches positioned
    /// before the cut fail with `FeedLagged`.
    pub fn compact_oplog(&self, keep: u64) -> Result<u64> {
        self.inner.log.compact(keep).map_err(backend)
    }
}

fn doc_key<'a>(db: &'a str, collection: &'a str, obj: &'a RawObject) -> DocKey<'a> {
    DocKey { db, collection, name: &obj.metadata.name, workspace: &obj.metadata.workspace }
}

fn is_tombstone(doc: &serde_json::Value) -> bool {
    doc.pointer("/metadata/is_delete").and_then(serde_json::Value::as_bool).unwrap_or(false)
}

pub(crate) fn backend(e: anyhow::Error) -> Error {
    Error::Backend(format!("{:#}", e))
}
