//! # dprobe-core - Core Domain Types
//!
//! Foundation crate for dprobe. Provides the stream/process/agent domain
//! types, the transport event and command model, error handling, and the
//! logging bootstrap.
//!
//! This crate has **zero internal dependencies** -- it only depends on
//! external crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Stream`] - A device connection observed on the transport
//! - [`Process`] - A running program on a stream, identified structurally
//! - [`AgentState`] - Agent connection lifecycle (Disconnected, Attaching, ...)
//! - [`DeviceInfo`] - Device metadata behind a stream
//!
//! ### Events (`events`)
//! - [`TransportEvent`] - One event on the shared stream (timestamp, topic, payload)
//! - [`EventPayload`] - Tagged payload union with exhaustive matching
//! - [`EventGroup`] - One entity's recorded lifecycle, replayed by the catalog
//! - [`EventKind`] - Topic tag partitioning the stream
//!
//! ### Commands (`commands`)
//! - [`Command`] / [`CommandPayload`] - Typed fire-and-forget outbound messages
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with recoverability classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use dprobe_core::prelude::*;
//! ```

pub mod commands;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all dprobe crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use commands::{Command, CommandPayload};
pub use error::{Error, Result, ResultExt};
pub use events::{AgentStatus, EventGroup, EventKind, EventPayload, TransportEvent};
pub use types::{
    AgentState, DeviceInfo, PayloadId, Process, ProcessId, Stream, StreamId, StreamKind,
};
