//! One controller per handler: a North loop, one South loop per cluster, and
//! the stop fan-out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use nimbus_core::{EventType, Lifecycle, Phase, RawEvent, RawObject};
use nimbus_kubehub::{ClusterChange, ClusterClient, ClusterRegistry, SouthEvent};
use nimbus_store::WatchStream;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::{Handler, NorthHandler};
use crate::BridgeError;

const REOPEN_BACKOFF_MIN: Duration = Duration::from_millis(100);
const REOPEN_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// What a controller ran, reported when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub north_loops: usize,
    /// South loops opened over the controller's life.
    pub south_loops: usize,
    /// One per loop still running at cancellation.
    pub stop_signals: usize,
}

/// Running loops keyed by id, each with its stop sender. Loops that end on
/// their own are reaped, so the maps track only live loops.
#[derive(Default)]
struct Loops {
    tasks: JoinSet<u64>,
    stops: FxHashMap<u64, oneshot::Sender<()>>,
    next_id: u64,
}

impl Loops {
    fn spawn<F, Fut>(&mut self, start: F) -> u64
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.stops.insert(id, tx);
        let run = start(rx);
        self.tasks.spawn(async move {
            run.await;
            id
        });
        id
    }

    fn stop(&mut self, id: u64) {
        if let Some(tx) = self.stops.remove(&id) {
            let _ = tx.send(());
        }
    }

    fn live(&self) -> usize {
        self.stops.len()
    }

    /// Signal every live loop and wait for all of them. Returns the signals sent.
    async fn shutdown(mut self) -> usize {
        let sent = self.stops.len();
        for (_, tx) in self.stops.drain() {
            let _ = tx.send(());
        }
        while self.tasks.join_next().await.is_some() {}
        sent
    }
}

pub struct BackendController {
    handler: Arc<dyn Handler>,
    clusters: Arc<ClusterRegistry>,
}

impl BackendController {
    pub fn new(handler: Arc<dyn Handler>, clusters: Arc<ClusterRegistry>) -> Self {
        Self { handler, clusters }
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Run until `ctx` is cancelled. Channel failures go to `errors`; a failed
    /// North feed is re-opened with backoff. Callback failures are logged and
    /// the event dropped.
    pub async fn run(self, ctx: CancellationToken, errors: mpsc::Sender<BridgeError>) -> RunSummary {
        let name = self.handler.name().to_string();
        let mut summary = RunSummary::default();
        let mut loops = Loops::default();

        if let Some(north) = self.handler.as_north() {
            match north.north_event_ch(&ctx).await {
                Ok(stream) => {
                    let gate = NorthGate::new(north.lifecycle());
                    let (handler, ctx, errors) = (self.handler.clone(), ctx.clone(), errors.clone());
                    loops.spawn(move |stop| north_loop(handler, ctx, stream, gate, stop, errors));
                    summary.north_loops += 1;
                }
                Err(e) => report(&errors, &name, e.context("opening north channel")).await,
            }
        }

        // subscribe before listing so a cluster added meanwhile is not missed
        let mut changes = self.clusters.subscribe();
        // cluster -> client the loop watches, loop id
        let mut opened: FxHashMap<String, (Arc<ClusterClient>, u64)> = FxHashMap::default();
        let south_enabled = self.handler.as_south().is_some();
        if let Some(south) = self.handler.as_south() {
            match south.south_event_chs(&ctx, &self.clusters).await {
                Ok(chs) => {
                    for (cluster, rx) in chs {
                        let handler = self.handler.clone();
                        let label = cluster.clone();
                        let id = loops.spawn(move |stop| south_loop(handler, label, rx, stop));
                        if let Some(client) = self.clusters.get(&cluster) {
                            opened.insert(cluster, (client, id));
                        }
                        summary.south_loops += 1;
                    }
                }
                Err(e) => report(&errors, &name, e.context("opening south channels")).await,
            }
        }
        info!(handler = %name, north = summary.north_loops, south = summary.south_loops, "controller started");

        let mut listening = south_enabled;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                Some(done) = loops.tasks.join_next(), if !loops.tasks.is_empty() => {
                    if let Ok(id) = done {
                        loops.stops.remove(&id);
                        opened.retain(|_, (_, lid)| *lid != id);
                    }
                }
                change = changes.recv(), if listening => match change {
                    Ok(ClusterChange::Added(client)) => {
                        if opened.get(client.name()).map(|(c, _)| Arc::ptr_eq(c, &client)).unwrap_or(false) {
                            continue;
                        }
                        let Some(south) = self.handler.as_south() else { continue };
                        match south.south_event_ch(&ctx, &client).await {
                            Ok(Some(rx)) => {
                                debug!(handler = %name, cluster = %client.name(), "south loop opened for new cluster");
                                let handler = self.handler.clone();
                                let label = client.name().to_string();
                                let id = loops.spawn(move |stop| south_loop(handler, label, rx, stop));
                                summary.south_loops += 1;
                                if let Some((_, old)) = opened.insert(client.name().to_string(), (client, id)) {
                                    loops.stop(old);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(handler = %name, cluster = %client.name(), error = %format!("{:#}", e), "south watch not opened"),
                        }
                    }
                    Ok(ClusterChange::Removed(cluster)) => {
                        if let Some((_, id)) = opened.remove(&cluster) {
                            loops.stop(id);
                            debug!(handler = %name, cluster = %cluster, live = loops.live(), "south loop stopped for removed cluster");
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(handler = %name, missed = n, "cluster changes lagged"),
                    Err(RecvError::Closed) => listening = false,
                },
            }
        }

        summary.stop_signals = loops.shutdown().await;
        info!(handler = %name, stops = summary.stop_signals, "controller stopped");
        summary
    }
}

async fn report(errors: &mpsc::Sender<BridgeError>, handler: &str, error: anyhow::Error) {
    counter!("bridge_channel_errors_total", 1u64, "handler" => handler.to_string());
    warn!(handler, error = %format!("{:#}", error), "controller channel failed");
    let _ = errors.send(BridgeError { handler: handler.to_string(), error }).await;
}

/// Per-object phase tracking against the handler's lifecycle.
pub(crate) struct NorthGate {
    lifecycle: Option<Lifecycle>,
    phases: FxHashMap<String, Phase>,
}

impl NorthGate {
    pub(crate) fn new(lifecycle: Option<Lifecycle>) -> Self {
        Self { lifecycle, phases: FxHashMap::default() }
    }

    /// Whether the event should reach the North callbacks. An illegal
    /// transition is an error; the observed phase is still recorded.
    pub(crate) fn admit(&mut self, ev: &RawEvent) -> nimbus_core::Result<bool> {
        let Some(lc) = self.lifecycle else { return Ok(true) };
        let uid = &ev.object.metadata.uid;
        if ev.event_type == EventType::Deleted {
            self.phases.remove(uid);
            return Ok(true);
        }
        let phase = lc.phase_of(&ev.object)?;
        let prev = self.phases.insert(uid.clone(), phase);
        lc.check(prev, phase)?;
        Ok(lc.north_actionable(phase))
    }
}

async fn north_loop(
    handler: Arc<dyn Handler>,
    ctx: CancellationToken,
    mut stream: WatchStream<RawObject>,
    mut gate: NorthGate,
    mut stop: oneshot::Receiver<()>,
    errors: mpsc::Sender<BridgeError>,
) {
    let Some(north) = handler.as_north() else { return };
    let name = handler.name();
    loop {
        let next = tokio::select! {
            _ = &mut stop => break,
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                report(&errors, name, anyhow::Error::new(e).context("north feed failed")).await;
                match reopen(north, name, &ctx, &mut stop, &errors).await {
                    Some(fresh) => {
                        stream = fresh;
                        continue;
                    }
                    None => break,
                }
            }
            None => break,
        };
        counter!("bridge_events_total", 1u64, "handler" => name.to_string(), "direction" => "north");
        match gate.admit(&ev) {
            Ok(true) => {}
            Ok(false) => {
                debug!(handler = %name, name = %ev.object.metadata.name, "phase not actionable north; skipped");
                continue;
            }
            Err(e) => {
                counter!("bridge_rejected_transitions_total", 1u64, "handler" => name.to_string());
                warn!(handler = %name, name = %ev.object.metadata.name, error = %e, "event rejected");
                continue;
            }
        }
        let obj_name = ev.object.metadata.name.clone();
        let res = match ev.event_type {
            EventType::Added => north.north_on_add(ev.object).await,
            EventType::Modified => north.north_on_update(ev.object).await,
            EventType::Deleted => north.north_on_delete(ev.object).await,
        };
        if let Err(e) = res {
            counter!("bridge_callback_errors_total", 1u64, "handler" => name.to_string(), "direction" => "north");
            warn!(handler = %name, name = %obj_name, event = %ev.event_type, error = %format!("{:#}", e), "north callback failed; event dropped");
        }
    }
    debug!(handler = %name, "north loop stopped");
}

/// Open the North channel again, backing off between failed attempts. The
/// new feed starts from a full snapshot. `None` once the loop is stopped.
async fn reopen(
    north: &dyn NorthHandler,
    name: &str,
    ctx: &CancellationToken,
    stop: &mut oneshot::Receiver<()>,
    errors: &mpsc::Sender<BridgeError>,
) -> Option<WatchStream<RawObject>> {
    let mut delay = REOPEN_BACKOFF_MIN;
    loop {
        tokio::select! {
            _ = &mut *stop => return None,
            _ = ctx.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match north.north_event_ch(ctx).await {
            Ok(stream) => {
                counter!("bridge_north_reopened_total", 1u64, "handler" => name.to_string());
                info!(handler = %name, "north channel reopened");
                return Some(stream);
            }
            Err(e) => {
                report(errors, name, e.context("reopening north channel")).await;
                delay = (delay * 2).min(REOPEN_BACKOFF_MAX);
            }
        }
    }
}

async fn south_loop(handler: Arc<dyn Handler>, cluster: String, mut rx: mpsc::Receiver<SouthEvent>, mut stop: oneshot::Receiver<()>) {
    let Some(south) = handler.as_south() else { return };
    let name = handler.name();
    loop {
        let ev = tokio::select! {
            _ = &mut stop => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        counter!("bridge_events_total", 1u64, "handler" => name.to_string(), "direction" => "south");
        let event_type = ev.event_type;
        let res = match event_type {
            EventType::Added => south.south_on_add(&cluster, ev.object).await,
            EventType::Modified => south.south_on_update(&cluster, ev.object).await,
            EventType::Deleted => south.south_on_delete(&cluster, ev.object).await,
        };
        if let Err(e) = res {
            counter!("bridge_callback_errors_total", 1u64, "handler" => name.to_string(), "direction" => "south");
            warn!(handler = %name, cluster = %cluster, event = %event_type, error = %format!("{:#}", e), "south callback failed; event dropped");
        }
    }
    debug!(handler = %name, cluster = %cluster, "south loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::Event;
    use serde_json::json;

    fn ev(t: EventType, uid: &str, status: &str) -> RawEvent {
        let mut o = RawObject::raw("workspace", "w", json!({ "status": status }));
        o.metadata.uid = uid.into();
        Event::new(t, o)
    }

    #[test]
    fn ungated_handlers_see_everything() {
        let mut g = NorthGate::new(None);
        assert!(g.admit(&ev(EventType::Modified, "u", "RUNNING")).unwrap());
    }

    #[test]
    fn south_phases_are_not_dispatched_north() {
        let mut g = NorthGate::new(Some(Lifecycle::workload("workspace")));
        assert!(g.admit(&ev(EventType::Added, "u", "INIT")).unwrap());
        assert!(!g.admit(&ev(EventType::Modified, "u", "RUNNING")).unwrap());
        assert!(g.admit(&ev(EventType::Modified, "u", "UPDATE")).unwrap());
        assert!(g.admit(&ev(EventType::Deleted, "u", "UPDATE")).unwrap());
    }

    #[test]
    fn illegal_transitions_are_rejected_per_object() {
        let mut g = NorthGate::new(Some(Lifecycle::workload("workspace")));
        g.admit(&ev(EventType::Added, "a", "DELETE")).unwrap();
        g.admit(&ev(EventType::Added, "b", "INIT")).unwrap();
        assert!(g.admit(&ev(EventType::Modified, "a", "UPDATE")).is_err());
        assert!(g.admit(&ev(EventType::Modified, "b", "UPDATE")).unwrap());
    }
}
