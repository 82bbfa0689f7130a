//! Continuously updated view of eligible streams and processes
//!
//! Independent of any inspector client's transient selection: the manager
//! tracks every eligible device stream and its processes for as long as it
//! is alive, so a presentation layer always has a current list to offer.
//! Eligibility is device streams at or above the configured minimum API
//! level.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use dprobe_core::events::{EventKind, EventPayload, TransportEvent};
use dprobe_core::prelude::*;
use dprobe_core::types::{Process, ProcessId, Stream, StreamId, StreamKind};

use crate::poller::{EventListener, ListenerId, PollerHandle};

type ChangeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    /// Live processes keyed by owning stream. A stream's whole entry is
    /// dropped when the stream disconnects.
    streams: BTreeMap<Stream, BTreeMap<ProcessId, Process>>,
    /// Per-stream process listeners installed on the poller.
    process_listeners: HashMap<StreamId, ListenerId>,
    change_listeners: Vec<ChangeListener>,
    disposed: bool,
}

/// Tracks all eligible (stream, process) pairs until disposed.
///
/// All map mutations happen on the poller's dispatch context; reads may come
/// from any thread. Change listeners run synchronously on the dispatch
/// context and must not block.
pub struct ProcessManager {
    poller: PollerHandle,
    state: Arc<Mutex<ManagerState>>,
    stream_listener: ListenerId,
}

impl ProcessManager {
    /// Install the stream listener and start tracking.
    pub fn new(poller: PollerHandle, min_api_level: u32) -> Self {
        let state: Arc<Mutex<ManagerState>> = Arc::new(Mutex::new(ManagerState::default()));

        let stream_listener = {
            let state = Arc::clone(&state);
            let poller_for_callback = poller.clone();
            poller.register(EventListener::new(EventKind::Stream, move |event| {
                on_stream_event(&state, &poller_for_callback, min_api_level, event);
            }))
        };

        Self {
            poller,
            state,
            stream_listener,
        }
    }

    /// Currently tracked streams, ordered by stream id.
    pub fn streams(&self) -> Vec<Stream> {
        lock(&self.state).streams.keys().cloned().collect()
    }

    /// Live processes on `stream`, sorted by pid. Empty for untracked streams.
    pub fn processes(&self, stream: &Stream) -> Vec<Process> {
        lock(&self.state)
            .streams
            .get(stream)
            .map(|processes| processes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// True iff exactly this (stream, process) pair is currently tracked.
    ///
    /// Structural comparison: a new process that reuses a removed process's
    /// pid is a different entity and does not make the old one active.
    pub fn is_process_active(&self, stream: &Stream, process: &Process) -> bool {
        lock(&self.state)
            .streams
            .get(stream)
            .and_then(|processes| processes.get(&process.pid))
            .is_some_and(|tracked| tracked == process)
    }

    /// Register a callback fired after every tracked-set change.
    pub fn on_change(&self, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.state).change_listeners.push(Arc::new(listener));
    }

    /// Stop tracking: no further callbacks fire, the map empties.
    ///
    /// Only the stream listener is unregistered here. Per-stream process
    /// listeners still installed on the poller are left in place: the
    /// manager is disposed together with the poller, and the disposed flag
    /// already makes their callbacks no-ops.
    pub fn dispose(&self) {
        {
            let mut st = lock(&self.state);
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.streams.clear();
            st.process_listeners.clear();
            st.change_listeners.clear();
        }
        self.poller.unregister(self.stream_listener);
        debug!("process manager disposed");
    }
}

fn lock(state: &Mutex<ManagerState>) -> std::sync::MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn notify_change(state: &Arc<Mutex<ManagerState>>) {
    let listeners = lock(state).change_listeners.clone();
    for listener in listeners {
        listener();
    }
}

fn on_stream_event(
    state: &Arc<Mutex<ManagerState>>,
    poller: &PollerHandle,
    min_api_level: u32,
    event: &TransportEvent,
) {
    if event.is_ended {
        remove_stream(state, poller, event.stream_id);
        return;
    }

    let EventPayload::Stream(stream) = &event.payload else {
        return;
    };
    if stream.kind != StreamKind::Device || stream.device.api_level < min_api_level {
        trace!("ignoring ineligible stream {}", stream.stream_id);
        return;
    }

    let is_new = {
        let mut st = lock(state);
        if st.disposed || st.streams.contains_key(stream) {
            false
        } else {
            st.streams.insert(stream.clone(), BTreeMap::new());
            true
        }
    };
    if !is_new {
        return;
    }

    // Watch this stream's process lifecycle for as long as it is connected.
    let process_listener = {
        let state = Arc::clone(state);
        poller.register(
            EventListener::new(EventKind::Process, move |event| {
                on_process_event(&state, event);
            })
            .for_stream(stream.stream_id),
        )
    };
    lock(state)
        .process_listeners
        .insert(stream.stream_id, process_listener);

    debug!(
        "tracking stream {} ({})",
        stream.stream_id,
        stream.device.display_name()
    );
    notify_change(state);
}

fn remove_stream(state: &Arc<Mutex<ManagerState>>, poller: &PollerHandle, stream_id: StreamId) {
    let (process_listener, removed) = {
        let mut st = lock(state);
        if st.disposed {
            return;
        }
        let key = st
            .streams
            .keys()
            .find(|s| s.stream_id == stream_id)
            .cloned();
        let removed = key.is_some_and(|k| st.streams.remove(&k).is_some());
        (st.process_listeners.remove(&stream_id), removed)
    };

    if let Some(listener) = process_listener {
        poller.unregister(listener);
    }
    if removed {
        debug!("stream {} disconnected, dropping its processes", stream_id);
        notify_change(state);
    }
}

fn on_process_event(state: &Arc<Mutex<ManagerState>>, event: &TransportEvent) {
    let EventPayload::Process(process) = &event.payload else {
        return;
    };

    let changed = {
        let mut st = lock(state);
        if st.disposed {
            return;
        }
        let Some(key) = st
            .streams
            .keys()
            .find(|s| s.stream_id == event.stream_id)
            .cloned()
        else {
            return;
        };
        let Some(processes) = st.streams.get_mut(&key) else {
            return;
        };
        if event.is_ended {
            processes.remove(&process.pid).is_some()
        } else {
            processes.insert(process.pid, process.clone());
            true
        }
    };

    if changed {
        notify_change(state);
    }
}
