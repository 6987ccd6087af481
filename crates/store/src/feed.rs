//! Change feed: a snapshot pass over current documents followed by a tail of
//! the write log. The tail wakes on the store's head watch instead of polling.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use nimbus_core::{Error, Event, EventType, Filter, Object, RawEvent, RawObject, Result, Spec, Version};
use nimbus_persist::{OpEntry, OpKind};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{backend, ObjectStore};

/// Pull side of a watch. `events` closes exactly once, when the feed ends;
/// a feed that ends on failure leaves the cause on `errors` first.
pub struct WatchStream<T> {
    pub events: mpsc::Receiver<Event<T>>,
    pub errors: mpsc::Receiver<Error>,
}

impl<T> WatchStream<T> {
    /// Next event, or the error that ended the feed. `None` after a clean stop.
    pub async fn next(&mut self) -> Option<Result<Event<T>>> {
        tokio::select! {
            biased;
            ev = self.events.recv() => match ev {
                Some(ev) => Some(Ok(ev)),
                None => self.errors.try_recv().ok().map(Err),
            },
            Some(err) = self.errors.recv() => Some(Err(err)),
        }
    }
}

/// Push side of a watch.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: RawEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<RawEvent> {
    async fn send(&mut self, event: RawEvent) -> anyhow::Result<()> {
        mpsc::Sender::send(self, event).await.map_err(|_| anyhow::anyhow!("event sink closed"))
    }
}

impl ObjectStore {
    /// Watch one collection. Documents already stored with a version above
    /// `min_version` arrive first as ADDED, then every later write.
    pub fn watch_event(
        &self,
        ctx: &CancellationToken,
        db: &str,
        collection: &str,
        min_version: Version,
        filter: Filter,
    ) -> WatchStream<RawObject> {
        self.spawn_feed(ctx, db, collection, min_version, filter, Ok)
    }

    /// `watch_event` for a registered kind, decoding every object.
    pub fn watch_typed<S: Spec>(
        &self,
        ctx: &CancellationToken,
        db: &str,
        min_version: Version,
        filter: Filter,
    ) -> WatchStream<Object<S>> {
        let coders = self.coders().clone();
        self.spawn_feed(ctx, db, S::KIND, min_version, filter, move |raw| coders.decode::<S>(raw))
    }

    /// Push every event into `sink` until cancelled. Returns the feed error,
    /// or `Closed` when the sink rejects an event.
    pub async fn watch(
        &self,
        ctx: &CancellationToken,
        db: &str,
        collection: &str,
        min_version: Version,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let child = ctx.child_token();
        let mut stream = self.watch_event(&child, db, collection, min_version, Filter::new());
        while let Some(next) = stream.next().await {
            let ev = next?;
            if let Err(e) = sink.send(ev).await {
                debug!(error = %e, collection, "event sink rejected event; stopping watch");
                child.cancel();
                return Err(Error::Closed);
            }
        }
        Ok(())
    }

    /// Ping the backend every `interval`; each failure lands on the returned channel.
    pub fn health_check(&self, ctx: &CancellationToken, interval: Duration) -> mpsc::Receiver<Error> {
        let (tx, rx) = mpsc::channel(4);
        let log = self.log().clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = log.ping() {
                            counter!("store_health_failures_total", 1u64);
                            warn!(error = %e, "store health check failed");
                            if tx.send(backend(e)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("health check stopped");
        });
        rx
    }

    fn spawn_feed<T, F>(
        &self,
        ctx: &CancellationToken,
        db: &str,
        collection: &str,
        min_version: Version,
        filter: Filter,
        decode: F,
    ) -> WatchStream<T>
    where
        T: Send + 'static,
        F: Fn(RawObject) -> Result<T> + Send + Sync + 'static,
    {
        let (ev_tx, events) = mpsc::channel(self.config().queue_cap);
        let (err_tx, errors) = mpsc::channel(1);
        let feed = Feed {
            store: self.clone(),
            db: db.to_string(),
            collection: collection.to_string(),
            min_version,
            filter,
            seen: FxHashMap::default(),
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let collection = feed.collection.clone();
            counter!("feed_watches_started_total", 1u64);
            match feed.run(&ctx, &ev_tx, &decode).await {
                Ok(()) | Err(Error::Closed) => info!(collection = %collection, "change feed stopped"),
                Err(e) => {
                    counter!("feed_errors_total", 1u64);
                    warn!(collection = %collection, error = %e, "change feed failed");
                    let _ = err_tx.send(e).await;
                }
            }
            drop(ev_tx);
        });
        WatchStream { events, errors }
    }
}

struct Feed {
    store: ObjectStore,
    db: String,
    collection: String,
    min_version: Version,
    filter: Filter,
    /// uid -> version delivered by the snapshot pass
    seen: FxHashMap<String, Version>,
}

impl Feed {
    async fn run<T, F>(mut self, ctx: &CancellationToken, tx: &mpsc::Sender<Event<T>>, decode: &F) -> Result<()>
    where
        F: Fn(RawObject) -> Result<T> + Sync,
    {
        let mut head_rx = self.store.subscribe_head();
        let log = self.store.log().clone();
        let mut pos = log.head().map_err(backend)?;

        let current = self.store.list(&self.db, &self.collection, &self.filter).await?;
        let mut sent = 0usize;
        for obj in current.into_iter().filter(|o| !o.metadata.is_delete) {
            self.seen.insert(obj.metadata.uid.clone(), obj.metadata.version);
            if obj.metadata.version <= self.min_version {
                continue;
            }
            if !self.deliver(ctx, tx, decode, Event::new(EventType::Added, obj)).await? {
                return Ok(());
            }
            sent += 1;
        }
        debug!(collection = %self.collection, sent, from = pos, "snapshot delivered; tailing write log");

        let tail_filter = self.filter.clone().include_deleted();
        let batch = self.store.config().feed_batch;
        loop {
            let head = *head_rx.borrow_and_update();
            while pos < head {
                let compacted = log.compacted_through().map_err(backend)?;
                if compacted > pos {
                    return Err(Error::FeedLagged { position: pos });
                }
                let entries = log.read_log(&self.db, &self.collection, pos, head, batch).map_err(backend)?;
                let full = entries.len() >= batch;
                for entry in entries {
                    pos = entry.seq;
                    if !tail_filter.matches(&entry.doc) {
                        continue;
                    }
                    let Some(ev) = self.convert(entry)? else { continue };
                    if !self.deliver(ctx, tx, decode, ev).await? {
                        return Ok(());
                    }
                }
                if !full {
                    pos = head;
                }
            }
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                changed = head_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn convert(&mut self, entry: OpEntry) -> Result<Option<RawEvent>> {
        let obj = RawObject::from_document(entry.doc)?;
        let tombstoned = obj.metadata.is_delete;
        let event_type = match entry.op {
            OpKind::Insert if tombstoned => return Ok(None),
            OpKind::Insert => EventType::Added,
            OpKind::Update if tombstoned => EventType::Deleted,
            OpKind::Update => EventType::Modified,
            // the tombstone write already produced DELETED
            OpKind::Delete if tombstoned => return Ok(None),
            OpKind::Delete => EventType::Deleted,
        };
        if entry.op != OpKind::Delete {
            if let Some(v) = self.seen.get(&obj.metadata.uid) {
                if obj.metadata.version <= *v {
                    return Ok(None);
                }
                self.seen.remove(&obj.metadata.uid);
            }
        }
        Ok(Some(Event::new(event_type, obj)))
    }

    /// False once the watch should stop (cancelled or receiver gone).
    async fn deliver<T, F>(&self, ctx: &CancellationToken, tx: &mpsc::Sender<Event<T>>, decode: &F, ev: RawEvent) -> Result<bool>
    where
        F: Fn(RawObject) -> Result<T> + Sync,
    {
        let event_type = ev.event_type;
        let object = match decode(ev.object) {
            Ok(o) => o,
            Err(e) => {
                counter!("feed_decode_errors_total", 1u64);
                warn!(collection = %self.collection, error = %e, "dropping undecodable object");
                return Ok(true);
            }
        };
        tokio::select! {
            _ = ctx.cancelled() => Ok(false),
            sent = tx.send(Event::new(event_type, object)) => Ok(sent.is_ok()),
        }
    }
}
