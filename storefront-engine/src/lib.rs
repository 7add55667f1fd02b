//! Conversational shopping engine.
//!
//! Decodes free-form chat into cart and checkout actions, holding stock
//! against a reservation ledger for the duration of the conversation. Built
//! as seven narrow components wired together behind one [`Engine`]:
//!
//! - **Reservation Ledger** ([`aggregates::reservation`], C1) — per-line
//!   event-sourced stock holds with soft and checkout TTLs.
//! - **Session Store** ([`aggregates::session`], C2) — per-conversation
//!   turn history, cart, and pending checkout, event-sourced the same way.
//! - **Action Catalog** ([`catalog`], C3) — the validated action vocabulary
//!   shared by the NLU Adapter and the Action Executor.
//! - **NLU Adapter** ([`nlu`], C4) — turns user text into one validated
//!   [`catalog::Action`], circuit-broken against the language model.
//! - **Dialogue Controller** ([`dialogue`], C5) — the per-session turn loop.
//! - **Action Executor** ([`executor`], C6) — carries out an action against
//!   the outbound ports and the ledger.
//! - **Fan-out Hub** ([`hub`], C7) — delivers engine events to every
//!   connection attached to a session.
//!
//! Everything outside this crate — HTTP/WebSocket transports, concrete
//! catalog/cart/order/model adapters — plugs in through [`ports`].

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregates;
pub mod anthropic_adapter;
pub mod catalog;
pub mod config;
pub mod dialogue;
pub mod executor;
pub mod hub;
pub mod nlu;
pub mod ports;
pub mod registry;
pub mod types;

use config::EngineConfig;
use dialogue::DialogueController;
use executor::ActionExecutor;
use hub::Hub;
use nlu::NluAdapter;
use ports::{Cart, LanguageModel, Order, ProductCatalog};
use std::sync::Arc;

pub use dialogue::TurnError;
pub use types::{EngineEvent, EnvelopedEvent, SessionId, UserId};

use composable_rust_core::environment::Clock;
use composable_rust_core::event_bus::EventBus;
use composable_rust_core::event_store::EventStore;

/// Assembles the seven components behind one handle, the way an embedding
/// application is expected to construct and hold this crate.
///
/// Cloning an `Engine` is cheap: every field is an `Arc`, so clones share
/// the same sessions, reservation lines, and hub subscriptions.
#[derive(Clone)]
pub struct Engine {
    dialogue: Arc<DialogueController>,
    hub: Arc<Hub>,
}

impl Engine {
    /// Wires the engine from its outbound ports, infrastructure, and
    /// configuration.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        catalog: Arc<dyn ProductCatalog>,
        cart: Arc<dyn Cart>,
        order: Arc<dyn Order>,
        model: Arc<dyn LanguageModel>,
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let executor = Arc::new(ActionExecutor::new(
            catalog,
            cart,
            order,
            Arc::clone(&clock),
            Arc::clone(&event_store),
            Arc::clone(&event_bus),
        ));
        let nlu = NluAdapter::new(
            model,
            config.nlu.circuit_failure_threshold,
            config.nlu.circuit_timeout(),
        );
        let hub = Arc::new(Hub::new(config.hub.outbox_capacity));
        let dialogue = Arc::new(DialogueController::new(
            nlu,
            executor,
            Arc::clone(&hub),
            clock,
            event_store,
            event_bus,
            config.turn.history_window,
            config.turn.deadline(),
            config.nlu.call_deadline(),
            config.session.idle_timeout(),
            config.session.absolute_ttl(),
            config.reservation.soft_cart_ttl(),
            config.reservation.checkout_ttl(),
        ));

        Self { dialogue, hub }
    }

    /// Runs one turn for `session_id`, creating the session on first
    /// contact.
    ///
    /// # Errors
    ///
    /// See [`DialogueController::turn`].
    pub async fn turn(
        &self,
        session_id: SessionId,
        user_text: String,
        user_id: Option<UserId>,
    ) -> Result<EngineEvent, TurnError> {
        self.dialogue.turn(session_id, user_text, user_id).await
    }

    /// Cart, recent turn history, and lifecycle status for a session that
    /// has already had at least one turn, for transports that need to
    /// resume a conversation outside of a turn (e.g. on reconnect).
    pub async fn session_snapshot(&self, session_id: &SessionId) -> Option<types::SessionSnapshot> {
        self.dialogue.session_snapshot(session_id).await
    }

    /// Attaches a new connection to a session's event stream. See
    /// [`Hub::attach`].
    pub async fn attach(&self, session_id: SessionId) -> (hub::SubscriptionId, tokio::sync::mpsc::Receiver<EnvelopedEvent>) {
        self.hub.attach(session_id).await
    }

    /// Detaches a connection. See [`Hub::detach`].
    pub async fn detach(&self, session_id: &SessionId, subscription_id: hub::SubscriptionId) {
        self.hub.detach(session_id, subscription_id).await;
    }
}
