//! Transport event definitions
//!
//! Every event on the shared stream carries a topic tag ([`EventKind`]), the
//! (stream, process) pair it concerns, a monotonic timestamp used for both
//! ordering and dedup, and a typed payload. Entity lifecycle (streams,
//! processes) is reconstructed by replaying [`EventGroup`]s: the ordered
//! sequence of events for one entity, closed by a terminal event.

use serde::{Deserialize, Serialize};

use crate::types::{PayloadId, Process, ProcessId, Stream, StreamId};

/// Logical topic partitioning the shared event stream.
///
/// Every event and every listener interest carries exactly one kind; the
/// dedup ledger is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Stream (device connection) lifecycle.
    Stream,
    /// Process lifecycle.
    Process,
    /// Agent attach/detach status.
    Agent,
    /// Property snapshot notifications.
    Properties,
    /// Layout data notifications.
    Layout,
}

/// Attach status reported by the on-device agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentStatus {
    Attached,
    Detached,
}

/// Typed event payload union.
///
/// Matching is exhaustive at every dispatch boundary; unknown content is a
/// channel-implementation concern, not representable here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    /// Stream lifecycle: carries the stream description. The terminal event
    /// of the group is flagged via [`TransportEvent::is_ended`].
    Stream(Stream),
    /// Process lifecycle: carries the process description.
    Process(Process),
    /// Agent status change for a (stream, process) pair.
    Agent(AgentStatus),
    /// A property snapshot is ready; the blob is fetched by payload id.
    Properties { payload_id: PayloadId },
    /// New layout data is ready; the blob is fetched by payload id.
    Layout { payload_id: PayloadId },
}

impl EventPayload {
    /// The topic this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Stream(_) => EventKind::Stream,
            EventPayload::Process(_) => EventKind::Process,
            EventPayload::Agent(_) => EventKind::Agent,
            EventPayload::Properties { .. } => EventKind::Properties,
            EventPayload::Layout { .. } => EventKind::Layout,
        }
    }

    /// The payload id referenced by domain events, if any.
    pub fn payload_id(&self) -> Option<PayloadId> {
        match self {
            EventPayload::Properties { payload_id } | EventPayload::Layout { payload_id } => {
                Some(*payload_id)
            }
            _ => None,
        }
    }
}

/// A single event observed on the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// Monotonic device timestamp. Ordering and dedup key; delivery order is
    /// NOT guaranteed to follow it.
    pub timestamp: i64,
    pub stream_id: StreamId,
    pub pid: ProcessId,
    /// Marks the terminal event of this entity's group.
    pub is_ended: bool,
    pub payload: EventPayload,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match &self.payload {
            EventPayload::Stream(s) => {
                if self.is_ended {
                    format!("Stream {} ended", s.stream_id)
                } else {
                    format!("Stream {} connected ({})", s.stream_id, s.device.display_name())
                }
            }
            EventPayload::Process(p) => {
                if self.is_ended {
                    format!("Process {} ended", p.pid)
                } else {
                    format!("Process {} started ({})", p.pid, p.name)
                }
            }
            EventPayload::Agent(status) => format!("Agent {:?} (pid {})", status, self.pid),
            EventPayload::Properties { payload_id } => {
                format!("Properties ready (payload {})", payload_id)
            }
            EventPayload::Layout { payload_id } => {
                format!("Layout ready (payload {})", payload_id)
            }
        }
    }
}

/// All events sharing one group id, in arrival order.
///
/// A group is the full recorded lifecycle of one entity; replaying it tells
/// whether the entity still exists and what it currently looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGroup {
    /// Entity id the group tracks (stream id for stream groups, pid for
    /// process groups).
    pub group_id: i64,
    pub events: Vec<TransportEvent>,
}

impl EventGroup {
    pub fn new(group_id: i64, events: Vec<TransportEvent>) -> Self {
        Self { group_id, events }
    }

    /// True once the entity's lifecycle is over.
    ///
    /// An empty group counts as ended: when replay cannot prove the entity
    /// exists, under-reporting beats leaking a stale entry.
    pub fn is_ended(&self) -> bool {
        self.events.last().map_or(true, |e| e.is_ended)
    }

    /// The most recent stream description in the group, if this is a live
    /// stream group.
    pub fn latest_stream(&self) -> Option<&Stream> {
        self.events.iter().rev().find_map(|e| match &e.payload {
            EventPayload::Stream(s) if !e.is_ended => Some(s),
            _ => None,
        })
    }

    /// The most recent process description in the group, if this is a live
    /// process group.
    pub fn latest_process(&self) -> Option<&Process> {
        self.events.iter().rev().find_map(|e| match &e.payload {
            EventPayload::Process(p) if !e.is_ended => Some(p),
            _ => None,
        })
    }
}
