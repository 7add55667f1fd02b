//! Dialogue Controller (C5).
//!
//! The per-session turn loop: single-threaded within one session, any number
//! of sessions proceed in parallel. Owns the one cross-aggregate orchestration
//! point in this crate — it is the only module that touches both the Session
//! Store and the Action Executor, the same way a saga orchestrator is the
//! only place that touches more than one aggregate at once.
//!
//! **Why a turn lock on top of the `Store`'s own lock.** A session's `Store`
//! only serializes a single `send()` call; a turn is several `send()` calls
//! (`RecordUserTurn`, the NLU decode in between, `RecordAssistantTurn`, ...)
//! plus the Action Executor's own port calls, none of which the `Store` knows
//! about. Without an explicit per-session turn lock two concurrent turns for
//! the same session could interleave their `send()` calls and violate the
//! strict-FIFO-per-session guarantee; the lock here is what actually
//! establishes it.

use crate::aggregates::session::{session_stream_id, PendingCheckout, SessionAction, SessionEnvironment, SessionReducer, SessionState};
use crate::catalog::Action;
use crate::executor::ActionExecutor;
use crate::hub::Hub;
use crate::nlu::{NluAdapter, NluError};
use crate::registry::AggregateRegistry;
use crate::types::{ActionError, ActionOutcome, CartSnapshot, ErrorCode, EngineEvent, SessionId, SessionSnapshot, SessionStatus, UserId};
use composable_rust_core::environment::Clock;
use composable_rust_core::event_bus::EventBus;
use composable_rust_core::event_store::EventStore;
use composable_rust_runtime::Store;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type SessionStore = Store<SessionState, SessionAction, SessionEnvironment, SessionReducer>;
type SessionRegistry = AggregateRegistry<SessionId, SessionState, SessionAction, SessionEnvironment, SessionReducer>;

/// A turn failed before it could produce any assistant reply at all. A
/// session that has already reached a terminal status is not an error of
/// this kind: the Controller starts a fresh session for the same id and
/// commits a `SESSION_EXPIRED` turn instead of failing outright. Every other
/// failure mode (NLU unavailable, port errors, validation failures) is
/// likewise folded into a normal [`crate::types::ActionOutcome::error`] and
/// still commits a turn, per the turn algorithm's error-handling rules.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    /// The turn did not complete within its deadline.
    #[error("turn deadline exceeded")]
    DeadlineExceeded,
}

/// Orchestrates one turn loop per session, serialized by an explicit
/// per-session lock distinct from the Session Store's own `Store` lock.
pub struct DialogueController {
    sessions: SessionRegistry,
    turn_locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
    nlu: NluAdapter,
    executor: Arc<ActionExecutor>,
    hub: Arc<Hub>,
    clock: Arc<dyn Clock>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
    history_window: usize,
    turn_deadline: Duration,
    nlu_call_deadline: Duration,
    idle_timeout: Duration,
    absolute_ttl: Duration,
    soft_cart_ttl: Duration,
    checkout_ttl: Duration,
}

impl DialogueController {
    /// Creates a new controller wired to the shared NLU Adapter, Action
    /// Executor, and Fan-out Hub.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nlu: NluAdapter,
        executor: Arc<ActionExecutor>,
        hub: Arc<Hub>,
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
        history_window: usize,
        turn_deadline: Duration,
        nlu_call_deadline: Duration,
        idle_timeout: Duration,
        absolute_ttl: Duration,
        soft_cart_ttl: Duration,
        checkout_ttl: Duration,
    ) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            turn_locks: Mutex::new(HashMap::new()),
            nlu,
            executor,
            hub,
            clock,
            event_store,
            event_bus,
            history_window,
            turn_deadline,
            nlu_call_deadline,
            idle_timeout,
            absolute_ttl,
            soft_cart_ttl,
            checkout_ttl,
        }
    }

    async fn session_store(&self, session_id: &SessionId) -> Arc<SessionStore> {
        let clock = Arc::clone(&self.clock);
        let event_store = Arc::clone(&self.event_store);
        let event_bus = Arc::clone(&self.event_bus);
        let idle_timeout = self.idle_timeout;
        let absolute_ttl = self.absolute_ttl;
        self.sessions
            .get_or_create(session_id.clone(), move |id| {
                SessionEnvironment::new(clock, event_store, event_bus, session_stream_id(id), idle_timeout, absolute_ttl)
            })
            .await
    }

    /// Evicts whatever `Store` is registered for `session_id` and installs a
    /// fresh one, used when a session has reached a terminal status and the
    /// Controller needs to start over under the same id (§7 `SESSION_EXPIRED`).
    async fn replace_session_store(&self, session_id: &SessionId) -> Arc<SessionStore> {
        let clock = Arc::clone(&self.clock);
        let event_store = Arc::clone(&self.event_store);
        let event_bus = Arc::clone(&self.event_bus);
        let idle_timeout = self.idle_timeout;
        let absolute_ttl = self.absolute_ttl;
        self.sessions
            .replace(session_id.clone(), move |id| {
                SessionEnvironment::new(clock, event_store, event_bus, session_stream_id(id), idle_timeout, absolute_ttl)
            })
            .await
    }

    async fn turn_lock(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        Arc::clone(locks.entry(session_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Runs one full turn for `session_id`, creating the session on first
    /// contact. Blocks behind any turn already in flight for this session;
    /// turns are served strictly FIFO per session.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::DeadlineExceeded`] if the turn's outer deadline
    /// elapses. Every other failure (a terminal session, NLU unavailable,
    /// port errors, validation failures) is absorbed into the committed
    /// turn's [`crate::types::ActionOutcome::error`] instead of surfacing
    /// here, matching the turn algorithm's rule that no turn is ever dropped.
    pub async fn turn(&self, session_id: SessionId, user_text: String, user_id: Option<UserId>) -> Result<EngineEvent, TurnError> {
        let lock = self.turn_lock(&session_id).await;
        let _guard = lock.lock().await;

        match tokio::time::timeout(self.turn_deadline, self.turn_locked(&session_id, user_text, user_id)).await {
            Ok(result) => result,
            Err(_) => Err(TurnError::DeadlineExceeded),
        }
    }

    async fn turn_locked(&self, session_id: &SessionId, user_text: String, user_id: Option<UserId>) -> Result<EngineEvent, TurnError> {
        let store = self.session_store(session_id).await;
        let now = self.clock.now();

        let is_created = store.state(SessionState::is_created).await;
        if !is_created {
            store
                .send(SessionAction::Create {
                    session_id: session_id.clone(),
                    user_id,
                    currency: "USD".to_string(),
                    now,
                })
                .await;
        }

        let status = store.state(|s| s.status).await;
        if status.is_terminal() {
            let fresh = self.replace_session_store(session_id).await;
            fresh
                .send(SessionAction::Create {
                    session_id: session_id.clone(),
                    user_id,
                    currency: "USD".to_string(),
                    now,
                })
                .await;
            fresh
                .send(SessionAction::RecordUserTurn {
                    text: user_text.clone(),
                    now,
                })
                .await;
            let outcome = ActionOutcome::error(
                "Your previous session ended, so I've started a new one for you. What can I help you find?",
                ActionError {
                    code: ErrorCode::SessionExpired,
                    message: "session had reached a terminal status; a fresh session was created".to_string(),
                },
            );
            fresh
                .send(SessionAction::RecordAssistantTurn {
                    decoded_action: None,
                    outcome: outcome.clone(),
                    now,
                })
                .await;
            self.publish_outcome(session_id, &outcome).await;
            return Ok(EngineEvent::AssistantMessage { text: outcome.assistant_text });
        }

        self.hub.publish(session_id, EngineEvent::TypingIndicator { active: true }).await;

        store
            .send(SessionAction::RecordUserTurn {
                text: user_text.clone(),
                now,
            })
            .await;

        let (history, cart) = store.state(|s| (s.turns.clone(), s.cart.clone())).await;

        let (decoded_action, action) = match self.nlu.decode(&history, self.history_window, &cart, &user_text, self.nlu_call_deadline).await {
            Ok(action) => (Some(action.clone()), action),
            Err(NluError::ModelUnavailable(_)) => (
                None,
                Action::Clarify {
                    prompt: "Our assistant is temporarily unavailable. Please try again in a moment.".to_string(),
                },
            ),
            Err(NluError::Undecodable(_)) => (
                None,
                Action::Clarify {
                    prompt: "Sorry, I didn't quite catch that — could you rephrase?".to_string(),
                },
            ),
        };

        let pending_checkout = store.state(|s| s.pending_checkout.clone()).await;
        let outcome = self
            .executor
            .apply(
                session_id,
                &cart,
                pending_checkout.as_ref(),
                &action,
                self.soft_cart_ttl,
                self.checkout_ttl,
            )
            .await;

        self.reconcile_checkout_state(&store, &action, &outcome, &pending_checkout).await;

        let now = self.clock.now();
        store
            .send(SessionAction::RecordAssistantTurn {
                decoded_action: decoded_action.clone(),
                outcome: outcome.clone(),
                now,
            })
            .await;

        if let Some(snapshot) = outcome.cart_snapshot.clone() {
            store.send(SessionAction::UpdateCart { snapshot }).await;
        }

        if matches!(action, Action::ConfirmOrder { .. }) && outcome.error.is_none() {
            store
                .send(SessionAction::Transition {
                    status: SessionStatus::Completed,
                    now,
                })
                .await;
        }

        self.publish_outcome(session_id, &outcome).await;

        Ok(EngineEvent::AssistantMessage { text: outcome.assistant_text })
    }

    /// Keeps the session's reserved-line set and pending checkout details in
    /// sync with what the Action Executor actually did, without the
    /// Executor itself needing to know about the Session Store.
    async fn reconcile_checkout_state(
        &self,
        store: &SessionStore,
        action: &Action,
        outcome: &crate::types::ActionOutcome,
        pending_checkout: &Option<PendingCheckout>,
    ) {
        match action {
            Action::RemoveFromCart { product_id, variant_id } if outcome.error.is_none() => {
                store
                    .send(SessionAction::DetachReservedLine {
                        product_id: *product_id,
                        variant_id: *variant_id,
                    })
                    .await;
            },
            Action::UpdateCartItem { product_id, variant_id, quantity } if *quantity == 0 && outcome.error.is_none() => {
                store
                    .send(SessionAction::DetachReservedLine {
                        product_id: *product_id,
                        variant_id: *variant_id,
                    })
                    .await;
            },
            Action::AddToCart { product_id, variant_id, .. } | Action::UpdateCartItem { product_id, variant_id, .. }
                if outcome.error.is_none() =>
            {
                store
                    .send(SessionAction::AttachReservedLine {
                        product_id: *product_id,
                        variant_id: *variant_id,
                    })
                    .await;
            },
            Action::StartCheckout {
                contact,
                shipping_address,
                billing_address,
            } if outcome.error.is_none() => {
                store
                    .send(SessionAction::SetPendingCheckout {
                        contact: contact.clone(),
                        shipping_address: shipping_address.clone(),
                        billing_address: billing_address.clone().unwrap_or_else(|| shipping_address.clone()),
                    })
                    .await;
            },
            Action::ConfirmOrder { .. } if outcome.error.is_none() && pending_checkout.is_some() => {
                let lines = store.state(|s| s.reserved_lines.clone()).await;
                for (product_id, variant_id) in lines {
                    store.send(SessionAction::DetachReservedLine { product_id, variant_id }).await;
                }
                store.send(SessionAction::ClearPendingCheckout).await;
            },
            Action::Cancel if outcome.error.is_none() => {
                let lines = store.state(|s| s.reserved_lines.clone()).await;
                for (product_id, variant_id) in lines {
                    store.send(SessionAction::DetachReservedLine { product_id, variant_id }).await;
                }
                store.send(SessionAction::ClearPendingCheckout).await;
            },
            _ => {},
        }
    }

    async fn publish_outcome(&self, session_id: &SessionId, outcome: &crate::types::ActionOutcome) {
        self.hub.publish(session_id, EngineEvent::TypingIndicator { active: false }).await;
        self.hub
            .publish(session_id, EngineEvent::AssistantMessage { text: outcome.assistant_text.clone() })
            .await;
        if !outcome.attached_products.is_empty() {
            self.hub
                .publish(
                    session_id,
                    EngineEvent::SuggestionsAttached {
                        product_ids: outcome.attached_products.clone(),
                    },
                )
                .await;
        }
        if let Some(snapshot) = outcome.cart_snapshot.clone() {
            self.hub.publish(session_id, EngineEvent::CartUpdated { snapshot }).await;
        }
        if let Some(error) = &outcome.error {
            self.hub
                .publish(
                    session_id,
                    EngineEvent::Error {
                        code: error.code,
                        message: error.message.clone(),
                    },
                )
                .await;
        }
    }

    /// Snapshot of a session's working cart, recent turn history, and
    /// lifecycle status, for transports that need to resume a conversation
    /// outside of a turn (e.g. on reconnect).
    pub async fn session_snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        if !self.sessions.keys().await.contains(session_id) {
            return None;
        }
        let store = self.session_store(session_id).await;
        let history_window = self.history_window;
        Some(
            store
                .state(move |s| SessionSnapshot {
                    cart: s.cart.clone(),
                    turns: s.turns.iter().rev().take(history_window).rev().cloned().collect(),
                    status: s.status,
                })
                .await,
        )
    }
}
