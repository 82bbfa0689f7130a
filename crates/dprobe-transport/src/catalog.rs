//! Stream/process discovery by event-group replay
//!
//! Entity existence is never queried directly: the agent host records each
//! stream's and process's full lifecycle as a group of events closed by a
//! terminal event. Replaying the groups and discarding the closed ones
//! reconstructs what is alive right now.

use std::collections::BTreeMap;
use std::sync::Arc;

use dprobe_core::events::EventKind;
use dprobe_core::prelude::*;
use dprobe_core::types::{Process, Stream, StreamKind};

use crate::channel::TransportChannel;

/// One-shot discovery of live streams and their processes.
pub struct ProcessCatalog<C> {
    channel: Arc<C>,
}

impl<C> ProcessCatalog<C>
where
    C: TransportChannel + Send + Sync,
{
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }

    /// Replay the recorded event groups into the current set of live device
    /// streams and the live processes on each.
    ///
    /// Two-phase: stream groups first, then process groups scoped to each
    /// surviving device stream. Groups whose last event is terminal are
    /// dead entities and are discarded; so are groups replay cannot prove
    /// alive (under-reporting beats leaking stale entries).
    ///
    /// Deterministic: with no device changes in between, two calls return
    /// structurally equal maps (ordered keys, processes sorted by pid).
    ///
    /// Performs one channel round trip per phase. Do not call from a
    /// latency-sensitive context; completion may take as long as the
    /// backend needs.
    pub async fn discover(&self) -> Result<BTreeMap<Stream, Vec<Process>>> {
        let stream_groups = self
            .channel
            .query_event_groups(None, EventKind::Stream)
            .await?;

        let mut result = BTreeMap::new();
        for group in &stream_groups {
            if group.is_ended() {
                continue;
            }
            let Some(stream) = group.latest_stream() else {
                continue;
            };
            if stream.kind != StreamKind::Device {
                continue;
            }
            let processes = self.discover_processes(stream).await?;
            result.insert(stream.clone(), processes);
        }

        debug!("discovered {} live device stream(s)", result.len());
        Ok(result)
    }

    async fn discover_processes(&self, stream: &Stream) -> Result<Vec<Process>> {
        let groups = self
            .channel
            .query_event_groups(Some(stream.stream_id), EventKind::Process)
            .await?;

        let mut processes: Vec<Process> = groups
            .iter()
            .filter(|group| !group.is_ended())
            .filter_map(|group| group.latest_process())
            .filter(|process| process.alive)
            .cloned()
            .collect();
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        process_ended_event, process_started_event, sample_process, sample_stream,
        stream_connected_event, stream_ended_event, FakeTransport,
    };
    use dprobe_core::events::EventGroup;

    fn catalog_with(transport: Arc<FakeTransport>) -> ProcessCatalog<FakeTransport> {
        ProcessCatalog::new(transport)
    }

    #[tokio::test]
    async fn test_discover_keeps_live_device_streams() {
        let transport = Arc::new(FakeTransport::new());
        let stream = sample_stream(1, 33);
        transport.add_stream_group(EventGroup::new(
            1,
            vec![stream_connected_event(10, stream.clone())],
        ));
        transport.add_process_group(
            1,
            EventGroup::new(42, vec![process_started_event(20, sample_process(42, 1))]),
        );

        let catalog = catalog_with(Arc::clone(&transport));
        let map = catalog.discover().await.unwrap();

        assert_eq!(map.len(), 1);
        let processes = map.get(&stream).unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 42);
    }

    #[tokio::test]
    async fn test_discover_discards_ended_streams() {
        let transport = Arc::new(FakeTransport::new());
        let dead = sample_stream(1, 33);
        transport.add_stream_group(EventGroup::new(
            1,
            vec![
                stream_connected_event(10, dead.clone()),
                stream_ended_event(20, dead),
            ],
        ));
        let live = sample_stream(2, 33);
        transport.add_stream_group(EventGroup::new(
            2,
            vec![stream_connected_event(15, live.clone())],
        ));

        let map = catalog_with(Arc::clone(&transport)).discover().await.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&live));
    }

    #[tokio::test]
    async fn test_discover_discards_ended_and_dead_processes() {
        let transport = Arc::new(FakeTransport::new());
        let stream = sample_stream(1, 33);
        transport.add_stream_group(EventGroup::new(
            1,
            vec![stream_connected_event(10, stream.clone())],
        ));

        // Ended group: process came and went.
        let gone = sample_process(41, 1);
        transport.add_process_group(
            1,
            EventGroup::new(
                41,
                vec![
                    process_started_event(11, gone.clone()),
                    process_ended_event(12, gone),
                ],
            ),
        );
        // Open group but the descriptor itself is not alive.
        let mut zombie = sample_process(43, 1);
        zombie.alive = false;
        transport.add_process_group(
            1,
            EventGroup::new(43, vec![process_started_event(13, zombie)]),
        );
        // Live.
        transport.add_process_group(
            1,
            EventGroup::new(42, vec![process_started_event(14, sample_process(42, 1))]),
        );

        let map = catalog_with(Arc::clone(&transport)).discover().await.unwrap();
        let processes = map.get(&stream).unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 42);
    }

    #[tokio::test]
    async fn test_discover_skips_non_device_streams() {
        let transport = Arc::new(FakeTransport::new());
        let mut replay = sample_stream(1, 33);
        replay.kind = StreamKind::File;
        transport.add_stream_group(EventGroup::new(
            1,
            vec![stream_connected_event(10, replay)],
        ));

        let map = catalog_with(Arc::clone(&transport)).discover().await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_discover_treats_empty_group_as_ended() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_stream_group(EventGroup::new(1, Vec::new()));

        let map = catalog_with(Arc::clone(&transport)).discover().await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_discover_is_deterministic() {
        let transport = Arc::new(FakeTransport::new());
        for stream_id in [3, 1, 2] {
            let stream = sample_stream(stream_id, 33);
            transport.add_stream_group(EventGroup::new(
                stream_id,
                vec![stream_connected_event(10 + stream_id, stream)],
            ));
            for pid in [30, 10, 20] {
                let process = sample_process(pid, stream_id);
                transport.add_process_group(
                    stream_id,
                    EventGroup::new(
                        pid as i64,
                        vec![process_started_event(100 + pid as i64, process)],
                    ),
                );
            }
        }

        let catalog = catalog_with(Arc::clone(&transport));
        let first = catalog.discover().await.unwrap();
        let second = catalog.discover().await.unwrap();
        assert_eq!(first, second);

        // Ordered keys, sorted pids.
        let stream_ids: Vec<_> = first.keys().map(|s| s.stream_id).collect();
        assert_eq!(stream_ids, vec![1, 2, 3]);
        let pids: Vec<_> = first.values().next().unwrap().iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_discover_propagates_transport_errors() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_fail_queries(true);
        let result = catalog_with(Arc::clone(&transport)).discover().await;
        assert!(result.is_err());
    }
}
