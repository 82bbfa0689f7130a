//! Event bus channel contract
//!
//! The channel is the single bidirectional link to the agent host that
//! multiplexes every device stream and process. The transport core consumes
//! only the semantics below and assumes nothing about the wire format;
//! concrete implementations (and test fakes) are injected where a
//! [`TransportChannel`] is expected.

use dprobe_core::commands::Command;
use dprobe_core::events::{EventGroup, EventKind, TransportEvent};
use dprobe_core::prelude::*;
use dprobe_core::types::{PayloadId, StreamId};

/// Bidirectional channel to the agent host.
///
/// All methods perform a full round trip to the backend service. Callers on
/// latency-sensitive threads must move these calls onto a background context.
#[trait_variant::make(TransportChannel: Send)]
pub trait LocalTransportChannel {
    /// Fetch all event groups of `kind`, optionally scoped to one stream.
    ///
    /// A group holds one entity's full recorded lifecycle in arrival order;
    /// the caller decides liveness by replay.
    async fn query_event_groups(
        &self,
        stream_id: Option<StreamId>,
        kind: EventKind,
    ) -> Result<Vec<EventGroup>>;

    /// Fetch events of `kind` with `timestamp > since`, ordered by timestamp
    /// **descending** (newest first).
    async fn query_events(&self, kind: EventKind, since: i64) -> Result<Vec<TransportEvent>>;

    /// Send a command to the agent host. Fire-and-forget: any response
    /// arrives later as an event, never as a synchronous reply.
    async fn execute(&self, command: Command) -> Result<()>;

    /// Fetch an out-of-band payload blob by id, scoped to one stream.
    async fn get_bytes(&self, stream_id: StreamId, payload_id: PayloadId) -> Result<Vec<u8>>;
}
