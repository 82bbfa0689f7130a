//! Inspector client: one attached process, mediated command/event traffic
//!
//! The client owns the single active (stream, process) selection. Attaching
//! runs the handshake state machine (`Disconnected → Attaching → Connected →
//! Capturing`); every group listener registered through [`register`] is
//! dedup-filtered and guarded against stale attachments, so a callback only
//! ever sees strictly newer data for the current selection.
//!
//! Construct one per consumer and inject the channel; there is deliberately
//! no shared default instance.
//!
//! [`register`]: InspectorClient::register

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use dprobe_core::commands::{Command, CommandPayload};
use dprobe_core::events::{AgentStatus, EventKind, EventPayload, TransportEvent};
use dprobe_core::prelude::*;
use dprobe_core::types::{AgentState, PayloadId, Process, ProcessId, Stream, StreamId};

use crate::catalog::ProcessCatalog;
use crate::channel::TransportChannel;
use crate::config::TransportConfig;
use crate::poller::{EventListener, ListenerId, PollerHandle};

struct ClientState {
    selection: Option<(Stream, Process)>,
    agent_state: AgentState,
    /// Last dispatched timestamp per event kind. Reset on every attach and
    /// disconnect; advanced immediately before each callback so dispatch
    /// order per kind is strictly increasing.
    ledger: HashMap<EventKind, i64>,
    /// Group listeners owned by this client's current attachment.
    listeners: Vec<ListenerId>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            selection: None,
            agent_state: AgentState::Disconnected,
            ledger: HashMap::new(),
            listeners: Vec::new(),
        }
    }
}

/// Transport client for one inspected process at a time.
///
/// `attach`/`disconnect` drive the selection; `register` adds dedup-filtered
/// group listeners; `execute`/`get_payload` mediate outbound traffic for the
/// current selection. All operations may be called from any thread; attach
/// attempts themselves are expected to be issued one at a time.
pub struct InspectorClient<C> {
    channel: Arc<C>,
    poller: PollerHandle,
    catalog: ProcessCatalog<C>,
    config: TransportConfig,
    state: Arc<Mutex<ClientState>>,
}

impl<C> InspectorClient<C>
where
    C: TransportChannel + Send + Sync,
{
    pub fn new(channel: Arc<C>, poller: PollerHandle, config: TransportConfig) -> Self {
        Self {
            catalog: ProcessCatalog::new(Arc::clone(&channel)),
            channel,
            poller,
            config,
            state: Arc::new(Mutex::new(ClientState::default())),
        }
    }

    /// Select `process` on `stream` and run the attach handshake.
    ///
    /// Implicitly invalidates any previous attachment: its listeners and
    /// dedup state are gone before the new attach command goes out. Does not
    /// block on the agent beyond the configured attach timeout; if the agent
    /// never acknowledges, an [`Error::AttachTimeout`] is returned and the
    /// client is back to `Disconnected`.
    pub async fn attach(&self, stream: Stream, process: Process) -> Result<()> {
        self.teardown();

        {
            let mut st = lock(&self.state);
            st.selection = Some((stream.clone(), process.clone()));
            st.agent_state = AgentState::Attaching;
        }
        info!(
            "attaching to pid {} on stream {}",
            process.pid, stream.stream_id
        );

        // Handshake listener goes in before the command so the
        // acknowledgement cannot race the registration.
        let (ack_tx, ack_rx) = oneshot::channel();
        let ack_tx = Mutex::new(Some(ack_tx));
        let handshake = self.poller.register(
            EventListener::new(EventKind::Agent, move |_event| {
                if let Some(tx) = ack_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(());
                }
            })
            .for_stream(stream.stream_id)
            .for_process(process.pid)
            .with_filter(|event| {
                matches!(event.payload, EventPayload::Agent(AgentStatus::Attached))
            })
            .once(),
        );

        let attach_cmd = Command::attach(
            stream.stream_id,
            process.pid,
            process.abi.clone(),
            self.config.agent_config_path.clone(),
        );
        if let Err(err) = self.channel.execute(attach_cmd).await {
            self.poller.unregister(handshake);
            self.teardown();
            return Err(err);
        }
        self.poller.poll_now();

        match tokio::time::timeout(self.config.attach_timeout(), ack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // The handshake listener was torn down underneath us.
                self.teardown();
                return Err(Error::ChannelClosed);
            }
            Err(_) => {
                warn!(
                    "agent did not acknowledge attach to pid {} within {:?}",
                    process.pid,
                    self.config.attach_timeout()
                );
                self.poller.unregister(handshake);
                self.teardown();
                return Err(Error::attach_timeout(self.config.attach_timeout()));
            }
        }

        {
            let mut st = lock(&self.state);
            st.agent_state = AgentState::Connected;
        }
        self.register_detach_watch(stream.stream_id, process.pid);

        // The agent is attached even if starting the capture fails; surface
        // the error so the caller can retry the start.
        self.channel
            .execute(Command::start_capture(stream.stream_id, process.pid))
            .await?;
        {
            let mut st = lock(&self.state);
            st.agent_state = AgentState::Capturing;
        }
        info!("capturing from pid {}", process.pid);
        Ok(())
    }

    /// Add a persistent, dedup-filtered listener for `kind` events.
    ///
    /// The callback fires only while connected, only for events tagged with
    /// the current selection, and only with a timestamp strictly above the
    /// ledger entry for `kind` -- stale attachments racing a new `attach` are
    /// silently dropped.
    pub fn register(
        &self,
        kind: EventKind,
        callback: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) {
        let state = Arc::clone(&self.state);
        let listener = self.poller.register(EventListener::new(kind, move |event| {
            let deliver = {
                let mut st = lock(&state);
                st.agent_state.is_connected()
                    && match &st.selection {
                        Some((stream, process))
                            if stream.stream_id == event.stream_id
                                && process.pid == event.pid =>
                        {
                            let last = st.ledger.get(&kind).copied().unwrap_or(i64::MIN);
                            if event.timestamp > last {
                                st.ledger.insert(kind, event.timestamp);
                                true
                            } else {
                                false
                            }
                        }
                        _ => false,
                    }
            };
            if deliver {
                callback(event);
            }
        }));
        lock(&self.state).listeners.push(listener);
    }

    /// Stamp `payload` with the current selection and send it.
    ///
    /// Dropped with a local log when nothing is attached, and command
    /// failures are logged rather than raised; callers needing a guarantee
    /// check [`is_connected`] first.
    ///
    /// [`is_connected`]: InspectorClient::is_connected
    pub async fn execute(&self, payload: CommandPayload) {
        let Some((stream_id, pid)) = self.connected_target() else {
            debug!("dropping command: no attached process");
            return;
        };
        let command = Command {
            stream_id,
            pid,
            payload,
        };
        if let Err(err) = self.channel.execute(command).await {
            warn!("command for pid {} failed: {}", pid, err);
        }
    }

    /// Fetch an out-of-band payload blob for the current selection.
    ///
    /// Events only ever carry payload ids; the blob itself comes through
    /// this separate round trip. Returns empty when nothing is attached or
    /// the fetch fails. Blocks on the channel; keep it off latency-sensitive
    /// contexts.
    pub async fn get_payload(&self, payload_id: PayloadId) -> Vec<u8> {
        let Some((stream_id, _)) = self.connected_target() else {
            debug!("dropping payload fetch {}: no attached process", payload_id);
            return Vec::new();
        };
        match self.channel.get_bytes(stream_id, payload_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("payload fetch {} failed: {}", payload_id, err);
                Vec::new()
            }
        }
    }

    /// One-shot discovery of live streams/processes.
    ///
    /// Delegates to [`ProcessCatalog::discover`]; same blocking caveat.
    pub async fn load_processes(&self) -> Result<BTreeMap<Stream, Vec<Process>>> {
        self.catalog.discover().await
    }

    /// Drop the selection and every listener owned by it.
    ///
    /// Effective immediately for future dispatch, even against a poll cycle
    /// in flight. A best-effort stop command goes to the agent afterwards.
    pub async fn disconnect(&self) {
        let target = self.connected_target();
        self.teardown();
        if let Some((stream_id, pid)) = target {
            if let Err(err) = self
                .channel
                .execute(Command::stop_capture(stream_id, pid))
                .await
            {
                debug!("stop capture on disconnect failed: {}", err);
            }
            info!("disconnected from pid {}", pid);
        }
    }

    pub fn agent_state(&self) -> AgentState {
        lock(&self.state).agent_state
    }

    /// True while commands may be sent to the agent.
    pub fn is_connected(&self) -> bool {
        lock(&self.state).agent_state.is_connected()
    }

    /// The currently selected (stream, process) pair, if any.
    pub fn selection(&self) -> Option<(Stream, Process)> {
        lock(&self.state).selection.clone()
    }

    fn connected_target(&self) -> Option<(StreamId, ProcessId)> {
        let st = lock(&self.state);
        match (&st.selection, st.agent_state.is_connected()) {
            (Some((stream, process)), true) => Some((stream.stream_id, process.pid)),
            _ => None,
        }
    }

    /// Track the agent dropping off on its own while we are attached.
    fn register_detach_watch(&self, stream_id: StreamId, pid: ProcessId) {
        let state = Arc::clone(&self.state);
        let listener = self.poller.register(
            EventListener::new(EventKind::Agent, move |event| {
                if !matches!(event.payload, EventPayload::Agent(AgentStatus::Detached)) {
                    return;
                }
                let mut st = lock(&state);
                let matches_selection = st
                    .selection
                    .as_ref()
                    .is_some_and(|(s, p)| s.stream_id == event.stream_id && p.pid == event.pid);
                if matches_selection {
                    warn!("agent detached from pid {}", event.pid);
                    st.agent_state = AgentState::Detached;
                }
            })
            .for_stream(stream_id)
            .for_process(pid),
        );
        lock(&self.state).listeners.push(listener);
    }

    /// Clear selection, ledger, and owned listeners; back to `Disconnected`.
    fn teardown(&self) {
        let listeners = {
            let mut st = lock(&self.state);
            st.selection = None;
            st.agent_state = AgentState::Disconnected;
            st.ledger.clear();
            std::mem::take(&mut st.listeners)
        };
        for listener in listeners {
            self.poller.unregister(listener);
        }
    }
}

fn lock(state: &Mutex<ClientState>) -> std::sync::MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}
