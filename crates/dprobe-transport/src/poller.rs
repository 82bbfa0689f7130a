//! Event poller: single consumer of the transport channel
//!
//! Turns the channel's pull-based "events since watermark" primitive into
//! push-based dispatch across many registered listeners. One background task
//! owns the channel queries and invokes every callback; components register
//! and unregister interests from arbitrary threads through a clonable
//! [`PollerHandle`].
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        EventPoller                          │
//! │                                                             │
//! │  ┌───────────────┐         ┌──────────────────────────┐    │
//! │  │ PollerHandle  │         │  Background Task          │    │
//! │  │               │         │                           │    │
//! │  │ register()  ──┼──lock──▶│  every tick (or poll_now):│    │
//! │  │ unregister()──┼──lock──▶│   query_events(kind, mark)│    │
//! │  │ poll_now()  ──┼──cmd───▶│   dispatch newest-first   │    │
//! │  └───────────────┘  chan   └──────────────────────────┘    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Delivery within a cycle is newest-first; callbacks must not assume
//! chronological order, only that a high-watermark comparison identifies
//! genuinely new data (the inspector client's dedup ledger relies on this).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use dprobe_core::events::{EventKind, TransportEvent};
use dprobe_core::prelude::*;
use dprobe_core::types::{ProcessId, StreamId};

use crate::channel::TransportChannel;

/// Capacity of the poller command channel.
const CMD_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Listener interests
// ---------------------------------------------------------------------------

type EventCallback = Arc<dyn Fn(&TransportEvent) + Send + Sync>;
type EventFilter = Arc<dyn Fn(&TransportEvent) -> bool + Send + Sync>;

/// Opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered interest in a slice of the event stream.
///
/// Built with [`EventListener::new`] plus the narrowing combinators; matching
/// is: kind, then optional stream/process scope, then the extra predicate.
pub struct EventListener {
    kind: EventKind,
    stream_id: Option<StreamId>,
    pid: Option<ProcessId>,
    filter: Option<EventFilter>,
    one_shot: bool,
    callback: EventCallback,
}

impl EventListener {
    /// A persistent listener for every event of `kind`.
    pub fn new(
        kind: EventKind,
        callback: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            stream_id: None,
            pid: None,
            filter: None,
            one_shot: false,
            callback: Arc::new(callback),
        }
    }

    /// Only match events on this stream.
    pub fn for_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Only match events for this process.
    pub fn for_process(mut self, pid: ProcessId) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Extra predicate evaluated after kind/stream/process scoping.
    pub fn with_filter(
        mut self,
        filter: impl Fn(&TransportEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Unregister automatically after the first matching dispatch.
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }

    fn matches(&self, event: &TransportEvent) -> bool {
        self.kind == event.kind()
            && self.stream_id.map_or(true, |s| s == event.stream_id)
            && self.pid.map_or(true, |p| p == event.pid)
            && self.filter.as_ref().map_or(true, |f| f(event))
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("pid", &self.pid)
            .field("one_shot", &self.one_shot)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Listener registry
// ---------------------------------------------------------------------------

/// Registration-ordered listener set. Shared between the handle (mutations
/// from arbitrary threads) and the dispatch loop, which locks per lookup and
/// never holds the lock across a callback.
#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(ListenerId, EventListener)>,
}

impl ListenerSet {
    fn insert(&mut self, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    fn get(&self, id: ListenerId) -> Option<&EventListener> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, listener)| listener)
    }

    fn ids(&self) -> Vec<ListenerId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    fn kinds(&self) -> BTreeSet<EventKind> {
        self.entries
            .iter()
            .map(|(_, listener)| listener.kind)
            .collect()
    }
}

type SharedListeners = Arc<Mutex<ListenerSet>>;

fn lock_set(listeners: &Mutex<ListenerSet>) -> std::sync::MutexGuard<'_, ListenerSet> {
    listeners.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

enum PollerCommand {
    /// Run a cycle now instead of waiting for the next tick.
    PollNow,
    /// Stop the background task.
    Shutdown,
}

/// Clonable registration/trigger handle for an [`EventPoller`].
///
/// Registration is effective for the next dispatched event; unregistration is
/// idempotent and effective immediately, even against a cycle already in
/// flight (the loop re-checks registration right before every callback).
#[derive(Clone)]
pub struct PollerHandle {
    listeners: SharedListeners,
    cmd_tx: mpsc::Sender<PollerCommand>,
}

impl PollerHandle {
    /// Add an interest. Safe to call from any thread, including from inside
    /// a listener callback.
    pub fn register(&self, listener: EventListener) -> ListenerId {
        lock_set(&self.listeners).insert(listener)
    }

    /// Remove an interest. No-op for unknown or already-removed ids.
    pub fn unregister(&self, id: ListenerId) {
        if !lock_set(&self.listeners).remove(id) {
            trace!("unregister of unknown listener {:?} ignored", id);
        }
    }

    /// Ask the background task to run a cycle without waiting for the next
    /// tick. Best-effort: if the trigger queue is full a scheduled tick will
    /// cover the request.
    pub fn poll_now(&self) {
        let _ = self.cmd_tx.try_send(PollerCommand::PollNow);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        lock_set(&self.listeners).entries.len()
    }
}

/// Background poll loop over a [`TransportChannel`].
///
/// Create with [`EventPoller::start`]; the task keeps a per-kind timestamp
/// watermark and only queries kinds some live listener cares about. A failed
/// query is logged and retried on the next tick; it never stops the loop and
/// never reaches listeners.
pub struct EventPoller {
    handle: PollerHandle,
    task: JoinHandle<()>,
}

impl EventPoller {
    /// Spawn the poll loop on the current tokio runtime.
    pub fn start<C>(channel: Arc<C>, poll_interval: Duration) -> Self
    where
        C: TransportChannel + Send + Sync + 'static,
    {
        let listeners: SharedListeners = Arc::new(Mutex::new(ListenerSet::default()));
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);

        let task = tokio::spawn(run_poll_loop(
            channel,
            Arc::clone(&listeners),
            cmd_rx,
            poll_interval,
        ));

        Self {
            handle: PollerHandle { listeners, cmd_tx },
            task,
        }
    }

    /// Clonable handle for registration and on-demand polling.
    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    /// See [`PollerHandle::register`].
    pub fn register(&self, listener: EventListener) -> ListenerId {
        self.handle.register(listener)
    }

    /// See [`PollerHandle::unregister`].
    pub fn unregister(&self, id: ListenerId) {
        self.handle.unregister(id)
    }

    /// See [`PollerHandle::poll_now`].
    pub fn poll_now(&self) {
        self.handle.poll_now()
    }

    /// Stop the background task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.handle.cmd_tx.send(PollerCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

async fn run_poll_loop<C>(
    channel: Arc<C>,
    listeners: SharedListeners,
    mut cmd_rx: mpsc::Receiver<PollerCommand>,
    poll_interval: Duration,
) where
    C: TransportChannel + Send + Sync,
{
    let mut watermarks: BTreeMap<EventKind, i64> = BTreeMap::new();
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                poll_cycle(channel.as_ref(), &listeners, &mut watermarks).await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PollerCommand::PollNow) => {
                        poll_cycle(channel.as_ref(), &listeners, &mut watermarks).await;
                    }
                    Some(PollerCommand::Shutdown) | None => {
                        debug!("event poller shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// One cycle: query every kind a live listener cares about, newest-first,
/// and dispatch.
async fn poll_cycle<C>(
    channel: &C,
    listeners: &Mutex<ListenerSet>,
    watermarks: &mut BTreeMap<EventKind, i64>,
) where
    C: TransportChannel + Send + Sync,
{
    let kinds = lock_set(listeners).kinds();

    for kind in kinds {
        let since = watermarks.get(&kind).copied().unwrap_or(i64::MIN);
        match channel.query_events(kind, since).await {
            Ok(events) => {
                if let Some(max_ts) = events.iter().map(|e| e.timestamp).max() {
                    let mark = watermarks.entry(kind).or_insert(i64::MIN);
                    if max_ts > *mark {
                        *mark = max_ts;
                    }
                }
                for event in &events {
                    dispatch(listeners, event);
                }
            }
            Err(err) => {
                // Retried on the next tick; never surfaced to listeners.
                warn!("poll cycle failed for {:?} events: {}", kind, err);
            }
        }
    }
}

/// Deliver one event to every matching listener, registration order.
fn dispatch(listeners: &Mutex<ListenerSet>, event: &TransportEvent) {
    let ids = lock_set(listeners).ids();

    for id in ids {
        // Re-check registration immediately before invoking: an unregister
        // that landed mid-cycle must suppress the callback. One-shot entries
        // leave the set before their callback runs so a burst of matches in
        // one cycle can never fire them twice.
        let callback = {
            let mut set = lock_set(listeners);
            match set.get(id) {
                Some(listener) if listener.matches(event) => {
                    let cb = Arc::clone(&listener.callback);
                    if listener.one_shot {
                        set.remove(id);
                    }
                    Some(cb)
                }
                _ => None,
            }
        };

        if let Some(cb) = callback {
            cb(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        agent_status_event, process_started_event, sample_process, sample_stream,
        stream_connected_event, wait_until, FakeTransport,
    };
    use dprobe_core::events::AgentStatus;

    const FAST_POLL: Duration = Duration::from_millis(5);

    fn recorder() -> (Arc<Mutex<Vec<i64>>>, impl Fn(&TransportEvent) + Send + Sync) {
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &TransportEvent| {
            sink.lock().unwrap().push(event.timestamp)
        })
    }

    #[tokio::test]
    async fn test_persistent_listener_receives_matching_events() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(EventListener::new(EventKind::Stream, callback));

        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(*seen.lock().unwrap(), vec![10]);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_delivered_newest_first_within_cycle() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));
        transport.push_event(stream_connected_event(30, sample_stream(2, 33)));
        transport.push_event(stream_connected_event(20, sample_stream(3, 33)));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(EventListener::new(EventKind::Stream, callback));

        assert!(wait_until(|| seen.lock().unwrap().len() == 3).await);
        assert_eq!(*seen.lock().unwrap(), vec![30, 20, 10]);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_not_redelivered_old_events() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(EventListener::new(EventKind::Stream, callback));

        assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);

        // Several more cycles pass; the watermark suppresses redelivery.
        tokio::time::sleep(FAST_POLL * 10).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        transport.push_event(stream_connected_event(20, sample_stream(2, 33)));
        assert!(wait_until(|| seen.lock().unwrap().len() == 2).await);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_and_process_scoping() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_event(process_started_event(10, sample_process(100, 1)));
        transport.push_event(process_started_event(20, sample_process(200, 2)));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(
            EventListener::new(EventKind::Process, callback)
                .for_stream(2)
                .for_process(200),
        );

        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        tokio::time::sleep(FAST_POLL * 4).await;
        assert_eq!(*seen.lock().unwrap(), vec![20]);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_extra_filter_applies_after_scoping() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_event(agent_status_event(10, 1, 42, AgentStatus::Detached));
        transport.push_event(agent_status_event(20, 1, 42, AgentStatus::Attached));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(
            EventListener::new(EventKind::Agent, callback)
                .for_stream(1)
                .with_filter(|e| {
                    matches!(
                        e.payload,
                        dprobe_core::events::EventPayload::Agent(AgentStatus::Attached)
                    )
                }),
        );

        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        tokio::time::sleep(FAST_POLL * 4).await;
        assert_eq!(*seen.lock().unwrap(), vec![20]);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_shot_fires_at_most_once_on_burst() {
        let transport = Arc::new(FakeTransport::new());
        // Three matching events land in the same poll cycle.
        transport.push_event(agent_status_event(10, 1, 42, AgentStatus::Attached));
        transport.push_event(agent_status_event(20, 1, 42, AgentStatus::Attached));
        transport.push_event(agent_status_event(30, 1, 42, AgentStatus::Attached));

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        let handle = poller.handle();
        handle.register(EventListener::new(EventKind::Agent, callback).once());

        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        tokio::time::sleep(FAST_POLL * 4).await;

        // Newest event of the burst, exactly once, and the entry is gone.
        assert_eq!(*seen.lock().unwrap(), vec![30]);
        assert_eq!(handle.listener_count(), 0);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let transport = Arc::new(FakeTransport::new());
        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);

        let id = poller.register(EventListener::new(EventKind::Stream, |_| {}));
        poller.unregister(id);
        poller.unregister(id); // second removal is a no-op
        assert_eq!(poller.handle().listener_count(), 0);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregistered_listener_receives_nothing() {
        let transport = Arc::new(FakeTransport::new());
        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);

        let (seen, callback) = recorder();
        let id = poller.register(EventListener::new(EventKind::Stream, callback));
        poller.unregister(id);

        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));
        tokio::time::sleep(FAST_POLL * 10).await;
        assert!(seen.lock().unwrap().is_empty());

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_transport_error_does_not_stop_the_poller() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_fail_queries(true);

        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let (seen, callback) = recorder();
        poller.register(EventListener::new(EventKind::Stream, callback));

        // Several failing cycles pass.
        tokio::time::sleep(FAST_POLL * 10).await;
        assert!(seen.lock().unwrap().is_empty());

        // Recovery on a later tick once the channel works again.
        transport.set_fail_queries(false);
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_now_triggers_immediate_cycle() {
        let transport = Arc::new(FakeTransport::new());
        // A long interval so only poll_now can deliver in time.
        let poller = EventPoller::start(Arc::clone(&transport), Duration::from_secs(60));
        // Consume the interval's immediate first tick.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (seen, callback) = recorder();
        poller.register(EventListener::new(EventKind::Stream, callback));
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));

        poller.poll_now();
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);

        poller.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_may_register_another_listener() {
        let transport = Arc::new(FakeTransport::new());
        let poller = EventPoller::start(Arc::clone(&transport), FAST_POLL);
        let handle = poller.handle();

        let (seen, callback) = recorder();
        let inner_handle = handle.clone();
        handle.register(
            EventListener::new(EventKind::Stream, move |_| {
                // Registering from inside a callback must not deadlock.
                inner_handle.register(EventListener::new(EventKind::Process, |_| {}));
            })
            .once(),
        );
        handle.register(EventListener::new(EventKind::Stream, callback));

        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));
        assert!(wait_until(|| !seen.lock().unwrap().is_empty()).await);
        assert_eq!(handle.listener_count(), 2);

        poller.shutdown().await;
    }
}
