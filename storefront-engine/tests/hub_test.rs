//! Integration coverage for the Fan-out Hub (C7): multiple subscribers
//! across multiple sessions, and the backpressure-detach guarantee.

use storefront_engine::hub::Hub;
use storefront_engine::types::{EngineEvent, SessionId};

#[tokio::test]
async fn both_subscribers_on_a_session_see_every_event_in_order() {
    let hub = Hub::new(16);
    let session_id = SessionId::generate();
    let (_first, mut first_rx) = hub.attach(session_id.clone()).await;
    let (_second, mut second_rx) = hub.attach(session_id.clone()).await;

    hub.publish(&session_id, EngineEvent::TypingIndicator { active: true }).await;
    hub.publish(&session_id, EngineEvent::AssistantMessage { text: "hi".to_string() }).await;
    hub.publish(&session_id, EngineEvent::TypingIndicator { active: false }).await;

    for rx in [&mut first_rx, &mut second_rx] {
        assert_eq!(rx.recv().await.unwrap().seq, 0);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }
}

#[tokio::test]
async fn detaching_one_session_leaves_another_untouched() {
    let hub = Hub::new(16);
    let session_a = SessionId::generate();
    let session_b = SessionId::generate();
    let (id_a, _rx_a) = hub.attach(session_a.clone()).await;
    let (_id_b, mut rx_b) = hub.attach(session_b.clone()).await;

    hub.detach(&session_a, id_a).await;
    hub.publish(&session_b, EngineEvent::TypingIndicator { active: true }).await;

    assert!(rx_b.recv().await.is_some());
    assert_eq!(hub.active_subscriptions().await, 1);
}

#[tokio::test]
async fn a_backed_up_subscriber_is_detached_without_dropping_events_for_others() {
    let hub = Hub::new(1);
    let session_id = SessionId::generate();
    let (_slow_id, _slow_rx) = hub.attach(session_id.clone()).await;
    let (_fast_id, mut fast_rx) = hub.attach(session_id.clone()).await;

    for _ in 0..10 {
        hub.publish(&session_id, EngineEvent::TypingIndicator { active: true }).await;
    }

    assert!(fast_rx.recv().await.is_some());
    assert!(hub.active_subscriptions().await <= 2);
}
