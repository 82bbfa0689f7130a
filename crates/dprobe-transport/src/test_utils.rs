//! Test utilities for the transport subsystem
//!
//! Provides [`FakeTransport`], a scripted in-memory channel, plus event
//! constructors shared by unit and integration tests.
//!
//! The fake operates at the **channel level**: it serves the same
//! group/event/command/payload primitives a real backend would, but nothing
//! here touches a device or a wire. Tests push events into its log and the
//! poller picks them up on its next cycle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use dprobe_core::commands::{Command, CommandPayload};
use dprobe_core::events::{AgentStatus, EventGroup, EventKind, EventPayload, TransportEvent};
use dprobe_core::prelude::*;
use dprobe_core::types::{DeviceInfo, PayloadId, Process, ProcessId, Stream, StreamId, StreamKind};

use crate::channel::TransportChannel;

// ---------------------------------------------------------------------------
// Event/type constructors
// ---------------------------------------------------------------------------

/// Creates a test device stream with the given API level.
pub fn sample_stream(stream_id: StreamId, api_level: u32) -> Stream {
    Stream {
        stream_id,
        kind: StreamKind::Device,
        device: DeviceInfo {
            manufacturer: "Google".to_string(),
            model: "Pixel 8".to_string(),
            serial: format!("serial-{stream_id}"),
            api_level,
        },
    }
}

/// Creates a live test process on `stream_id`.
pub fn sample_process(pid: ProcessId, stream_id: StreamId) -> Process {
    Process {
        pid,
        stream_id,
        name: format!("com.example.app{pid}"),
        abi: "arm64-v8a".to_string(),
        alive: true,
    }
}

pub fn stream_connected_event(timestamp: i64, stream: Stream) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id: stream.stream_id,
        pid: 0,
        is_ended: false,
        payload: EventPayload::Stream(stream),
    }
}

pub fn stream_ended_event(timestamp: i64, stream: Stream) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id: stream.stream_id,
        pid: 0,
        is_ended: true,
        payload: EventPayload::Stream(stream),
    }
}

pub fn process_started_event(timestamp: i64, process: Process) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id: process.stream_id,
        pid: process.pid,
        is_ended: false,
        payload: EventPayload::Process(process),
    }
}

pub fn process_ended_event(timestamp: i64, process: Process) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id: process.stream_id,
        pid: process.pid,
        is_ended: true,
        payload: EventPayload::Process(process),
    }
}

pub fn agent_status_event(
    timestamp: i64,
    stream_id: StreamId,
    pid: ProcessId,
    status: AgentStatus,
) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id,
        pid,
        is_ended: false,
        payload: EventPayload::Agent(status),
    }
}

pub fn properties_event(
    timestamp: i64,
    stream_id: StreamId,
    pid: ProcessId,
    payload_id: PayloadId,
) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id,
        pid,
        is_ended: false,
        payload: EventPayload::Properties { payload_id },
    }
}

pub fn layout_event(
    timestamp: i64,
    stream_id: StreamId,
    pid: ProcessId,
    payload_id: PayloadId,
) -> TransportEvent {
    TransportEvent {
        timestamp,
        stream_id,
        pid,
        is_ended: false,
        payload: EventPayload::Layout { payload_id },
    }
}

/// Poll `condition` every 10ms for up to 2s.
///
/// Returns true as soon as the condition holds; false on timeout. Keeps
/// timing-sensitive poller tests robust on slow CI machines.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeInner {
    /// Shared event log served by `query_events`.
    events: Vec<TransportEvent>,
    /// Stream lifecycle groups served by `query_event_groups(_, Stream)`.
    stream_groups: Vec<EventGroup>,
    /// Process lifecycle groups per stream.
    process_groups: HashMap<StreamId, Vec<EventGroup>>,
    /// Every command handed to `execute`, in order.
    commands: Vec<Command>,
    /// Blobs served by `get_bytes`.
    payloads: HashMap<(StreamId, PayloadId), Vec<u8>>,
    /// When set, an Attach command is acknowledged with an agent Attached
    /// event on the log, like a live agent would.
    auto_attach: bool,
    /// When set, queries fail with a transport error.
    fail_queries: bool,
    /// When set, `query_events` serves the log verbatim instead of newest
    /// first, simulating a backend that does not honor strict ordering.
    unordered: bool,
}

/// Scripted in-memory [`TransportChannel`].
#[derive(Default)]
pub struct FakeTransport {
    inner: Mutex<FakeInner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event to the shared log.
    pub fn push_event(&self, event: TransportEvent) {
        self.lock().events.push(event);
    }

    /// Install a stream lifecycle group for catalog queries.
    pub fn add_stream_group(&self, group: EventGroup) {
        self.lock().stream_groups.push(group);
    }

    /// Install a process lifecycle group scoped to `stream_id`.
    pub fn add_process_group(&self, stream_id: StreamId, group: EventGroup) {
        self.lock()
            .process_groups
            .entry(stream_id)
            .or_default()
            .push(group);
    }

    /// Make an attached agent blob fetchable.
    pub fn insert_payload(&self, stream_id: StreamId, payload_id: PayloadId, bytes: Vec<u8>) {
        self.lock().payloads.insert((stream_id, payload_id), bytes);
    }

    /// Acknowledge Attach commands with an agent Attached event.
    pub fn set_auto_attach(&self, enabled: bool) {
        self.lock().auto_attach = enabled;
    }

    /// Make queries fail with a transport error until reset.
    pub fn set_fail_queries(&self, enabled: bool) {
        self.lock().fail_queries = enabled;
    }

    /// Serve events in push order rather than newest first. Dedup consumers
    /// must survive a backend that mixes delivery order within a cycle.
    pub fn set_unordered(&self, enabled: bool) {
        self.lock().unordered = enabled;
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_timestamp(inner: &FakeInner) -> i64 {
        inner
            .events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(0)
            + 1
    }
}

impl TransportChannel for FakeTransport {
    async fn query_event_groups(
        &self,
        stream_id: Option<StreamId>,
        kind: EventKind,
    ) -> Result<Vec<EventGroup>> {
        let inner = self.lock();
        if inner.fail_queries {
            return Err(Error::transport("injected query failure"));
        }
        let groups = match kind {
            EventKind::Stream => inner.stream_groups.clone(),
            EventKind::Process => match stream_id {
                Some(id) => inner.process_groups.get(&id).cloned().unwrap_or_default(),
                None => inner
                    .process_groups
                    .values()
                    .flat_map(|groups| groups.iter().cloned())
                    .collect(),
            },
            _ => Vec::new(),
        };
        Ok(groups)
    }

    async fn query_events(&self, kind: EventKind, since: i64) -> Result<Vec<TransportEvent>> {
        let inner = self.lock();
        if inner.fail_queries {
            return Err(Error::transport("injected query failure"));
        }
        let mut events: Vec<TransportEvent> = inner
            .events
            .iter()
            .filter(|e| e.kind() == kind && e.timestamp > since)
            .cloned()
            .collect();
        // Newest first, per the channel contract.
        if !inner.unordered {
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
        Ok(events)
    }

    async fn execute(&self, command: Command) -> Result<()> {
        let mut inner = self.lock();
        if let CommandPayload::Attach { .. } = command.payload {
            if inner.auto_attach {
                let timestamp = Self::next_timestamp(&inner);
                let ack =
                    agent_status_event(timestamp, command.stream_id, command.pid, AgentStatus::Attached);
                inner.events.push(ack);
            }
        }
        inner.commands.push(command);
        Ok(())
    }

    async fn get_bytes(&self, stream_id: StreamId, payload_id: PayloadId) -> Result<Vec<u8>> {
        let inner = self.lock();
        if inner.fail_queries {
            return Err(Error::transport("injected query failure"));
        }
        inner
            .payloads
            .get(&(stream_id, payload_id))
            .cloned()
            .ok_or_else(|| Error::transport(format!("no payload {payload_id} on stream {stream_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_events_filters_and_sorts_descending() {
        let transport = FakeTransport::new();
        transport.push_event(stream_connected_event(10, sample_stream(1, 33)));
        transport.push_event(stream_connected_event(30, sample_stream(2, 33)));
        transport.push_event(process_started_event(20, sample_process(42, 1)));

        let events = transport.query_events(EventKind::Stream, i64::MIN).await.unwrap();
        let timestamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![30, 10]);

        let events = transport.query_events(EventKind::Stream, 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_attach_acknowledges_attach_command() {
        let transport = FakeTransport::new();
        transport.set_auto_attach(true);

        transport
            .execute(Command::attach(1, 42, "arm64-v8a", "agent.config"))
            .await
            .unwrap();

        let events = transport.query_events(EventKind::Agent, i64::MIN).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_id, 1);
        assert_eq!(events[0].pid, 42);
        assert_eq!(
            events[0].payload,
            EventPayload::Agent(AgentStatus::Attached)
        );
    }

    #[tokio::test]
    async fn test_get_bytes_round_trip() {
        let transport = FakeTransport::new();
        transport.insert_payload(1, 7, b"blob".to_vec());

        assert_eq!(transport.get_bytes(1, 7).await.unwrap(), b"blob");
        assert!(transport.get_bytes(1, 8).await.is_err());
        assert!(transport.get_bytes(2, 7).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_queries_injects_errors() {
        let transport = FakeTransport::new();
        transport.set_fail_queries(true);
        assert!(transport.query_events(EventKind::Stream, 0).await.is_err());
        assert!(transport
            .query_event_groups(None, EventKind::Stream)
            .await
            .is_err());
    }
}
