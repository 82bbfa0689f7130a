//! Outbound command types
//!
//! Commands are fire-and-forget: any response arrives later as an event on
//! the shared stream, never as a synchronous reply. Every command must be
//! stamped with the (stream, pid) it addresses; the inspector client does
//! the stamping for its current selection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ProcessId, StreamId};

/// A typed outbound message addressed to one (stream, process).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub stream_id: StreamId,
    pub pid: ProcessId,
    pub payload: CommandPayload,
}

/// What the command asks the agent (or agent host) to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandPayload {
    /// Inject the native agent into the target process. The ABI selects the
    /// agent binary variant; the config path points at agent configuration
    /// owned by the surrounding system.
    Attach { abi: String, config_path: PathBuf },
    /// Begin streaming capture events. No arguments.
    StartCapture,
    /// Stop streaming capture events.
    StopCapture,
    /// Request a property snapshot for one node; the snapshot arrives later
    /// as a PROPERTIES event carrying a payload id.
    GetProperties { view_id: i64 },
}

impl Command {
    pub fn attach(
        stream_id: StreamId,
        pid: ProcessId,
        abi: impl Into<String>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stream_id,
            pid,
            payload: CommandPayload::Attach {
                abi: abi.into(),
                config_path: config_path.into(),
            },
        }
    }

    pub fn start_capture(stream_id: StreamId, pid: ProcessId) -> Self {
        Self {
            stream_id,
            pid,
            payload: CommandPayload::StartCapture,
        }
    }

    pub fn stop_capture(stream_id: StreamId, pid: ProcessId) -> Self {
        Self {
            stream_id,
            pid,
            payload: CommandPayload::StopCapture,
        }
    }

    pub fn get_properties(stream_id: StreamId, pid: ProcessId, view_id: i64) -> Self {
        Self {
            stream_id,
            pid,
            payload: CommandPayload::GetProperties { view_id },
        }
    }
}
