//! Stream, process, and agent domain types
//!
//! A [`Stream`] is a device-level connection to the agent host; a
//! [`Process`] is a running program observed on exactly one stream. Both are
//! immutable snapshots: entity identity is the full structure, never the raw
//! id alone (pids are reused across restarts).

use serde::{Deserialize, Serialize};

/// Identifies a device connection. Stable for the connection's lifetime,
/// opaque otherwise.
pub type StreamId = i64;

/// Process id on a stream. Only meaningful together with the owning stream.
pub type ProcessId = i32;

/// Reference to an out-of-band payload blob held by the agent host.
pub type PayloadId = i32;

/// What kind of endpoint backs a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    /// A live device connection.
    Device,
    /// A recorded session replayed from a file.
    File,
}

/// Metadata about the device behind a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    /// OS capability level; gates which devices are eligible for inspection.
    pub api_level: u32,
}

impl DeviceInfo {
    /// Get a display string for the device
    pub fn display_name(&self) -> String {
        if self.manufacturer.is_empty() {
            self.model.clone()
        } else {
            format!("{} {}", self.manufacturer, self.model)
        }
    }
}

/// A device connection observed on the transport.
///
/// Created when a stream-connected event is replayed or dispatched; removed
/// when the terminal stream event is seen. Never mutated in between.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub device: DeviceInfo,
}

/// A process running on a [`Stream`].
///
/// A process is never valid independent of its stream: compare the full
/// (stream, process) structure, not the pid, to decide whether two
/// observations are the same entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub pid: ProcessId,
    /// The owning stream.
    pub stream_id: StreamId,
    pub name: String,
    /// ABI the process runs under; selects the agent binary variant on attach.
    pub abi: String,
    pub alive: bool,
}

/// Connection state of the inspection agent for the client's selection.
///
/// "No selection" is first-class: a client that never attached and a client
/// that disconnected are both `Disconnected`, never a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentState {
    /// No process selected, nothing attached.
    Disconnected,
    /// Attach command sent; waiting for the agent to acknowledge.
    Attaching,
    /// Agent acknowledged the attach and accepts commands.
    Connected,
    /// Capture started; domain events are flowing.
    Capturing,
    /// Terminal: the agent reported it detached from the process.
    Detached,
}

impl AgentState {
    /// True while commands may be sent to the agent.
    pub fn is_connected(&self) -> bool {
        matches!(self, AgentState::Connected | AgentState::Capturing)
    }
}
