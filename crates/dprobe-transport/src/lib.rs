//! # dprobe-transport - Inspection Transport Client
//!
//! The on-device inspection transport subsystem: discovers device streams
//! and the processes on them, attaches a native agent to one selected
//! process, exchanges typed commands and events with it, and fans the shared
//! event stream out to independently-filtered listeners while discarding
//! duplicates and stale data.
//!
//! Depends on [`dprobe_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Channel contract (`channel`)
//! - [`TransportChannel`] - Injected link to the agent host (queries,
//!   commands, payload fetches); the only integration point with a backend
//!
//! ### Event dispatch (`poller`)
//! - [`EventPoller`] - Background loop turning channel pulls into listener
//!   callbacks
//! - [`PollerHandle`] - Clonable register/unregister/poll-now handle
//! - [`EventListener`] - One interest: kind, optional scope, one-shot flag
//!
//! ### Discovery (`catalog`)
//! - [`ProcessCatalog`] - One-shot stream/process discovery by group replay
//!
//! ### Tracking (`manager`)
//! - [`ProcessManager`] - Continuously updated map of eligible streams and
//!   processes with change notifications
//!
//! ### Inspection (`client`)
//! - [`InspectorClient`] - Attach state machine, dedup-filtered listeners,
//!   command/payload traffic for the single active selection
//!
//! ### Configuration (`config`)
//! - [`TransportConfig`] - Poll period, attach timeout, eligibility level,
//!   agent config path

pub mod catalog;
pub mod channel;
pub mod client;
pub mod config;
pub mod manager;
pub mod poller;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

// Public API re-exports
pub use catalog::ProcessCatalog;
pub use channel::{LocalTransportChannel, TransportChannel};
pub use client::InspectorClient;
pub use config::TransportConfig;
pub use manager::ProcessManager;
pub use poller::{EventListener, EventPoller, ListenerId, PollerHandle};
