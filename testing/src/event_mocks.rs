//! In-memory event store and event bus for fast, deterministic testing.
//!
//! Complements [`crate::projection_mocks`] to provide a complete in-memory
//! testing infrastructure: reducers that depend on `EventStore`/`EventBus`
//! can be exercised end-to-end without a database or a broker.

use composable_rust_core::event::SerializedEvent;
use composable_rust_core::event_bus::{EventBus, EventBusError, EventStream};
use composable_rust_core::event_store::{EventStore, EventStoreError};
use composable_rust_core::stream::{StreamId, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Default channel capacity for [`InMemoryEventBus`].
///
/// Generous enough that test suites publishing bursts of events don't hit
/// `RecvError::Lagged` under normal (non-artificially-slow) subscribers.
const DEFAULT_BUS_CAPACITY: usize = 1024;

type StreamMap = HashMap<StreamId, Vec<SerializedEvent>>;
type SnapshotMap = HashMap<StreamId, (Version, Vec<u8>)>;

/// In-memory event store for fast, deterministic testing.
///
/// Streams live in a `HashMap` guarded by a single lock; optimistic
/// concurrency is enforced the same way a real store would: the caller's
/// `expected_version` is compared against the stream's current length.
#[derive(Clone, Debug)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<StreamMap>>,
    snapshots: Arc<RwLock<SnapshotMap>>,
}

impl InMemoryEventStore {
    /// Create a new, empty in-memory event store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Current version of a stream (number of events appended so far).
    ///
    /// Useful in tests that want to assert on version without going through
    /// `load_events`.
    #[must_use]
    pub fn current_version(&self, stream_id: &StreamId) -> Version {
        let streams = self.streams.read().unwrap();
        streams
            .get(stream_id)
            .map_or(Version::INITIAL, |events| Version::new(events.len() as u64))
    }

    /// Clear all streams and snapshots (for test isolation).
    pub fn clear(&self) {
        self.streams.write().unwrap().clear();
        self.snapshots.write().unwrap().clear();
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut streams = self.streams.write().unwrap();
            let stream = streams.entry(stream_id.clone()).or_default();
            let current = Version::new(stream.len() as u64);

            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual: current,
                    });
                }
            }

            stream.extend(events);
            Ok(Version::new(stream.len() as u64))
        })
    }

    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let streams = self.streams.read().unwrap();
            let Some(events) = streams.get(&stream_id) else {
                return Ok(Vec::new());
            };
            let skip = from_version.map_or(0, |v| v.value() as usize);
            Ok(events.iter().skip(skip).cloned().collect())
        })
    }

    fn save_snapshot(
        &self,
        stream_id: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.snapshots
                .write()
                .unwrap()
                .insert(stream_id, (version, state));
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(Version, Vec<u8>)>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.snapshots.read().unwrap().get(&stream_id).cloned()) })
    }
}

/// In-memory event bus for fast, deterministic testing.
///
/// Backed by a single `tokio::sync::broadcast` channel shared by every
/// topic; `subscribe` filters the shared stream down to the requested
/// topic names. This keeps ordering across topics identical to publish
/// order, which is stronger than production `EventBus` implementations
/// guarantee but never weaker — fine for tests.
#[derive(Clone, Debug)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<(String, SerializedEvent)>,
}

impl InMemoryEventBus {
    /// Create a new in-memory event bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a new in-memory event bus with an explicit channel capacity.
    ///
    /// Lower capacities are useful for tests that specifically want to
    /// exercise `RecvError::Lagged` behavior against a slow subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of active subscribers across all topics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            // No receivers is not an error: at-least-once delivery to whoever
            // happens to be listening, same as a real bus with zero consumers.
            let _ = self.sender.send((topic, event));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let mut receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok((topic, event)) => {
                            if topics.iter().any(|t| t == &topic) {
                                yield Ok(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "in-memory event bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn append_and_load_round_trips() {
        let store = InMemoryEventStore::new();
        let stream_id = StreamId::new("order-1");
        let events = vec![SerializedEvent::new("Created.v1".to_string(), vec![1, 2, 3], None)];

        let version = store
            .append_events(stream_id.clone(), Some(Version::INITIAL), events.clone())
            .await
            .unwrap();
        assert_eq!(version, Version::new(1));

        let loaded = store.load_events(stream_id, None).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event_type, "Created.v1");
    }

    #[tokio::test]
    async fn append_rejects_version_mismatch() {
        let store = InMemoryEventStore::new();
        let stream_id = StreamId::new("order-1");
        let event = SerializedEvent::new("Created.v1".to_string(), vec![1], None);

        store
            .append_events(stream_id.clone(), Some(Version::INITIAL), vec![event.clone()])
            .await
            .unwrap();

        let result = store
            .append_events(stream_id, Some(Version::INITIAL), vec![event])
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn load_events_from_version_skips_earlier_events() {
        let store = InMemoryEventStore::new();
        let stream_id = StreamId::new("order-1");
        let events = vec![
            SerializedEvent::new("A.v1".to_string(), vec![1], None),
            SerializedEvent::new("B.v1".to_string(), vec![2], None),
        ];
        store
            .append_events(stream_id.clone(), Some(Version::INITIAL), events)
            .await
            .unwrap();

        let loaded = store
            .load_events(stream_id, Some(Version::new(1)))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].event_type, "B.v1");
    }

    #[tokio::test]
    async fn snapshot_save_and_load() {
        let store = InMemoryEventStore::new();
        let stream_id = StreamId::new("order-1");
        assert!(store.load_snapshot(stream_id.clone()).await.unwrap().is_none());

        store
            .save_snapshot(stream_id.clone(), Version::new(5), vec![9, 9])
            .await
            .unwrap();

        let snapshot = store.load_snapshot(stream_id).await.unwrap();
        assert_eq!(snapshot, Some((Version::new(5), vec![9, 9])));
    }

    #[tokio::test]
    async fn subscribe_only_receives_matching_topics() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["order-events"]).await.unwrap();

        bus.publish(
            "payment-events",
            &SerializedEvent::new("PaymentTaken.v1".to_string(), vec![], None),
        )
        .await
        .unwrap();
        bus.publish(
            "order-events",
            &SerializedEvent::new("OrderPlaced.v1".to_string(), vec![], None),
        )
        .await
        .unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.event_type, "OrderPlaced.v1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let bus = InMemoryEventBus::new();
        let result = bus
            .publish(
                "order-events",
                &SerializedEvent::new("OrderPlaced.v1".to_string(), vec![], None),
            )
            .await;
        assert!(result.is_ok());
    }
}
