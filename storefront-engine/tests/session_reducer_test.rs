//! Integration coverage for the Session Store (C2) through a full `Store`,
//! complementing the aggregate's own in-module reducer tests.

use composable_rust_core::environment::SystemClock;
use composable_rust_core::stream::StreamId;
use composable_rust_runtime::Store;
use composable_rust_testing::mocks::{InMemoryEventBus, InMemoryEventStore};
use storefront_engine::aggregates::session::{SessionAction, SessionEnvironment, SessionReducer, SessionState};
use storefront_engine::types::{ActionOutcome, CartLine, CartSnapshot, ProductId, SessionId, SessionStatus};
use std::sync::Arc;
use std::time::Duration;

fn env() -> SessionEnvironment {
    SessionEnvironment::new(
        Arc::new(SystemClock),
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemoryEventBus::new()),
        StreamId::new("session-test"),
        Duration::from_secs(600),
        Duration::from_secs(3600 * 24),
    )
}

fn store() -> Arc<Store<SessionState, SessionAction, SessionEnvironment, SessionReducer>> {
    Arc::new(Store::new(SessionState::default(), SessionReducer::new(), env()))
}

#[tokio::test]
async fn a_full_turn_round_trip_updates_history_and_cart() {
    let store = store();
    let session_id = SessionId::generate();
    let now = chrono::Utc::now();

    store
        .send(SessionAction::Create {
            session_id,
            user_id: None,
            currency: "USD".to_string(),
            now,
        })
        .await;
    store
        .send(SessionAction::RecordUserTurn {
            text: "add running shoes".to_string(),
            now,
        })
        .await;

    let mut snapshot = CartSnapshot::empty("USD");
    let product_id = ProductId::new();
    snapshot.lines.push(CartLine {
        product_id,
        variant_id: None,
        quantity: 1,
        unit_price: 5000,
        line_total: 5000,
    });
    snapshot.reprice();

    store
        .send(SessionAction::RecordAssistantTurn {
            decoded_action: None,
            outcome: ActionOutcome::text("Added running shoes to your cart."),
            now,
        })
        .await;
    store.send(SessionAction::UpdateCart { snapshot: snapshot.clone() }).await;
    store.send(SessionAction::AttachReservedLine { product_id, variant_id: None }).await;

    let state = store.state(|s| s.clone()).await;
    assert_eq!(state.turns.len(), 2);
    assert_eq!(state.cart.lines.len(), 1);
    assert!(state.reserved_lines.contains(&(product_id, None)));
}

#[tokio::test]
async fn checkout_then_cancel_clears_pending_checkout_and_reserved_lines() {
    let store = store();
    let session_id = SessionId::generate();
    let now = chrono::Utc::now();
    let product_id = ProductId::new();

    store
        .send(SessionAction::Create {
            session_id,
            user_id: None,
            currency: "USD".to_string(),
            now,
        })
        .await;
    store.send(SessionAction::AttachReservedLine { product_id, variant_id: None }).await;
    store
        .send(SessionAction::SetPendingCheckout {
            contact: "a@b.com".to_string(),
            shipping_address: "1 Main St".to_string(),
            billing_address: "1 Main St".to_string(),
        })
        .await;

    assert!(store.state(|s| s.pending_checkout.clone()).await.is_some());

    store.send(SessionAction::DetachReservedLine { product_id, variant_id: None }).await;
    store.send(SessionAction::ClearPendingCheckout).await;

    let state = store.state(|s| s.clone()).await;
    assert!(state.pending_checkout.is_none());
    assert!(state.reserved_lines.is_empty());
}

#[tokio::test]
async fn transition_to_completed_is_terminal_and_rejects_further_turns() {
    let store = store();
    let session_id = SessionId::generate();
    let now = chrono::Utc::now();

    store
        .send(SessionAction::Create {
            session_id,
            user_id: None,
            currency: "USD".to_string(),
            now,
        })
        .await;
    store.send(SessionAction::Transition { status: SessionStatus::Completed, now }).await;

    store
        .send(SessionAction::RecordUserTurn {
            text: "one more thing".to_string(),
            now,
        })
        .await;

    let state = store.state(|s| s.clone()).await;
    assert!(state.status.is_terminal());
    assert!(state.turns.is_empty(), "a terminal session must not record new turns");
}
