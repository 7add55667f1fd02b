//! Session Store (C2).
//!
//! One aggregate instance (one event stream, one `Store`) per conversation —
//! exactly the same per-instance sharding [`crate::aggregates::reservation`]
//! uses for stock lines, and for the same reason: two unrelated
//! conversations must never serialize behind each other, and one
//! conversation's turns must always apply in order against a single
//! in-memory state.
//!
//! The aggregate only owns what a session *is*: its lifecycle, its priced
//! cart snapshot, its append-only turn history, and the set of reservation
//! lines it currently holds stock against. It does not call out to the
//! Reservation Ledger, the NLU Adapter, or any outbound port — that
//! cross-aggregate orchestration is the Dialogue Controller's job
//! (`dialogue.rs`), matching how the reservation line never calls the order
//! port either.

use crate::catalog::Action;
use crate::types::{
    ActionOutcome, CartSnapshot, ProductId, SessionId, SessionStatus, TurnRecord, UserId, VariantId,
};
use chrono::{DateTime, Utc};
use composable_rust_core::{
    append_events, delay, effect::Effect, environment::Clock, event_bus::EventBus,
    event_store::EventStore, publish_event, reducer::Reducer, smallvec, stream::StreamId, SmallVec,
};
use composable_rust_macros::Action as ActionDerive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Stream id for a session's conversation aggregate.
#[must_use]
pub fn session_stream_id(session_id: &SessionId) -> StreamId {
    StreamId::new(format!("session-{session_id}"))
}

/// A reservation line identified by `(product_id, variant_id)`, as tracked
/// from the session side so the Dialogue Controller knows which
/// reservation-line instances to contact on cancel/expire without having to
/// scan the whole cart history.
pub type ReservedLine = (ProductId, Option<VariantId>);

// ============================================================================
// State
// ============================================================================

/// State of a single conversation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionState {
    /// `None` until the first `Create` command has been applied; guards
    /// `Create` idempotency the same way a reservation line's zero `on_hand`
    /// guards an unseeded line.
    pub created_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Bound user, if any (open question: only settable via an explicit
    /// login action, never implied by a turn).
    pub user_id: Option<UserId>,
    /// Server-priced working cart.
    pub cart: CartSnapshot,
    /// Append-only conversation history, oldest first.
    pub turns: Vec<TurnRecord>,
    /// Lines this session currently holds an active reservation against.
    pub reserved_lines: BTreeSet<ReservedLine>,
    /// Last turn or lifecycle event, used to schedule the idle sweep.
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Contact/address details captured by `StartCheckout`, consumed by the
    /// matching `ConfirmOrder` or cleared by `Cancel`.
    pub pending_checkout: Option<PendingCheckout>,
    /// Last validation failure, surfaced to tests and diagnostics.
    pub last_error: Option<String>,
}

/// Contact/address details captured at `StartCheckout` time, needed again
/// when `ConfirmOrder` finally calls the order port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingCheckout {
    /// Contact email or phone.
    pub contact: String,
    /// Shipping address.
    pub shipping_address: String,
    /// Billing address (defaults to shipping if the user never supplied one).
    pub billing_address: String,
}

impl SessionState {
    /// Whether this instance has ever observed a `Create` command.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created_at.is_some()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Commands and events for the Session Store aggregate.
#[derive(ActionDerive, Clone, Debug, Serialize, Deserialize)]
pub enum SessionAction {
    // ---- Commands ----
    /// Start a new conversation. Idempotent: a second `Create` against an
    /// already-created instance is a no-op.
    #[command]
    Create {
        /// The session's own id (duplicated into events for projections
        /// that don't carry the stream id).
        session_id: SessionId,
        /// Bound user, if the session started from an authenticated client.
        user_id: Option<UserId>,
        /// Pricing currency for this session's cart.
        currency: String,
        /// Creation timestamp.
        now: DateTime<Utc>,
    },

    /// Append a user turn, prior to NLU decoding.
    #[command]
    RecordUserTurn {
        /// Raw user text.
        text: String,
        /// Turn timestamp.
        now: DateTime<Utc>,
    },

    /// Append the assistant's reply to a decoded turn.
    #[command]
    RecordAssistantTurn {
        /// The decoded action, if decoding and validation succeeded.
        decoded_action: Option<Action>,
        /// The outcome of executing (or failing to execute) that action.
        outcome: ActionOutcome,
        /// Turn timestamp.
        now: DateTime<Utc>,
    },

    /// Replace the working cart snapshot (server-priced, never
    /// client-supplied).
    #[command]
    UpdateCart {
        /// New snapshot.
        snapshot: CartSnapshot,
    },

    /// Record that this session now holds an active reservation on a line.
    #[command]
    AttachReservedLine {
        /// Product of the line.
        product_id: ProductId,
        /// Variant of the line, if any.
        variant_id: Option<VariantId>,
    },

    /// Record that this session no longer holds a reservation on a line.
    #[command]
    DetachReservedLine {
        /// Product of the line.
        product_id: ProductId,
        /// Variant of the line, if any.
        variant_id: Option<VariantId>,
    },

    /// Bind an authenticated user to this session.
    #[command]
    Login {
        /// The authenticated user.
        user_id: UserId,
    },

    /// Capture checkout contact/address details for the matching
    /// `ConfirmOrder`.
    #[command]
    SetPendingCheckout {
        /// Contact email or phone.
        contact: String,
        /// Shipping address.
        shipping_address: String,
        /// Billing address (already defaulted to shipping by the caller if
        /// the user never supplied one).
        billing_address: String,
    },

    /// Clear captured checkout details, on either a successful `ConfirmOrder`
    /// or an explicit `Cancel`.
    #[command]
    ClearPendingCheckout,

    /// Move the session to a terminal (or back to active, for tests) status.
    #[command]
    Transition {
        /// Target status.
        status: SessionStatus,
        /// Transition timestamp.
        now: DateTime<Utc>,
    },

    /// Sweep check: expires the session if `now` is past its absolute TTL
    /// (measured from `created_at`), or abandons it if `now` is at least
    /// `idle_timeout` past the last recorded activity.
    #[command]
    ExpireIfIdle {
        /// Sweep timestamp.
        now: DateTime<Utc>,
        /// Configured inactivity window.
        idle_timeout: std::time::Duration,
        /// Configured absolute session lifetime.
        absolute_ttl: std::time::Duration,
    },

    // ---- Events ----
    /// A new conversation was started.
    #[event]
    Created {
        /// The session's own id.
        session_id: SessionId,
        /// Bound user, if any.
        user_id: Option<UserId>,
        /// Pricing currency.
        currency: String,
        /// Creation timestamp.
        now: DateTime<Utc>,
    },

    /// A user turn was recorded.
    #[event]
    UserTurnRecorded {
        /// Raw user text.
        text: String,
        /// Turn timestamp.
        now: DateTime<Utc>,
    },

    /// An assistant turn was recorded.
    #[event]
    AssistantTurnRecorded {
        /// The decoded action, if any.
        decoded_action: Option<Action>,
        /// The execution outcome.
        outcome: ActionOutcome,
        /// Turn timestamp.
        now: DateTime<Utc>,
    },

    /// The working cart snapshot changed.
    #[event]
    CartSnapshotUpdated {
        /// New snapshot.
        snapshot: CartSnapshot,
    },

    /// A reservation line was attached to this session.
    #[event]
    ReservedLineAttached {
        /// Product of the line.
        product_id: ProductId,
        /// Variant of the line, if any.
        variant_id: Option<VariantId>,
    },

    /// A reservation line was detached from this session.
    #[event]
    ReservedLineDetached {
        /// Product of the line.
        product_id: ProductId,
        /// Variant of the line, if any.
        variant_id: Option<VariantId>,
    },

    /// A user logged into this session.
    #[event]
    UserLoggedIn {
        /// The authenticated user.
        user_id: UserId,
    },

    /// Checkout contact/address details were captured.
    #[event]
    PendingCheckoutSet {
        /// Contact email or phone.
        contact: String,
        /// Shipping address.
        shipping_address: String,
        /// Billing address.
        billing_address: String,
    },

    /// Captured checkout details were cleared.
    #[event]
    PendingCheckoutCleared,

    /// The session's lifecycle status changed.
    #[event]
    StatusChanged {
        /// New status.
        status: SessionStatus,
        /// Transition timestamp.
        now: DateTime<Utc>,
    },

    /// A command failed validation.
    #[event]
    ValidationFailed {
        /// Error message.
        error: String,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the Session Store aggregate.
#[derive(Clone)]
pub struct SessionEnvironment {
    /// Clock for timestamps.
    pub clock: Arc<dyn Clock>,
    /// Event store for persistence.
    pub event_store: Arc<dyn EventStore>,
    /// Event bus for publishing.
    pub event_bus: Arc<dyn EventBus>,
    /// Stream id for this session instance.
    pub stream_id: StreamId,
    /// Inactivity window after which an idle session is abandoned.
    pub idle_timeout: std::time::Duration,
    /// Absolute lifetime after which a session expires regardless of
    /// activity.
    pub absolute_ttl: std::time::Duration,
}

impl SessionEnvironment {
    /// Creates a new `SessionEnvironment`.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
        stream_id: StreamId,
        idle_timeout: std::time::Duration,
        absolute_ttl: std::time::Duration,
    ) -> Self {
        Self {
            clock,
            event_store,
            event_bus,
            stream_id,
            idle_timeout,
            absolute_ttl,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the Session Store aggregate.
#[derive(Clone, Debug, Default)]
pub struct SessionReducer;

impl SessionReducer {
    /// Creates a new `SessionReducer`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn create_effects(event: SessionAction, env: &SessionEnvironment) -> SmallVec<[Effect<SessionAction>; 4]> {
        let Ok(data) = bincode::serialize(&event) else {
            return SmallVec::new();
        };
        let serialized = composable_rust_core::event::SerializedEvent::new(event.event_type().to_string(), data, None);

        smallvec![
            append_events! {
                store: env.event_store,
                stream: env.stream_id.as_str(),
                expected_version: None,
                events: vec![serialized.clone()],
                on_success: |_version| None,
                on_error: |error| Some(SessionAction::ValidationFailed {
                    error: error.to_string()
                })
            },
            publish_event! {
                bus: env.event_bus,
                topic: "session-events",
                event: serialized,
                on_success: || None,
                on_error: |error| Some(SessionAction::ValidationFailed {
                    error: error.to_string()
                })
            }
        ]
    }

    fn schedule_idle_check(now: DateTime<Utc>, env: &SessionEnvironment) -> Effect<SessionAction> {
        let fires_at = now + chrono::Duration::from_std(env.idle_timeout).unwrap_or_default();
        delay! {
            duration: env.idle_timeout,
            action: SessionAction::ExpireIfIdle {
                now: fires_at,
                idle_timeout: env.idle_timeout,
                absolute_ttl: env.absolute_ttl,
            }
        }
    }

    fn apply_event(state: &mut SessionState, event: &SessionAction) {
        match event {
            SessionAction::Created {
                user_id,
                currency,
                now,
                ..
            } => {
                state.created_at = Some(*now);
                state.status = SessionStatus::Active;
                state.user_id = *user_id;
                state.cart = CartSnapshot::empty(currency.clone());
                state.last_activity_at = Some(*now);
                state.last_error = None;
            },
            SessionAction::UserTurnRecorded { text, now } => {
                state.turns.push(TurnRecord::user(text.clone(), *now));
                state.last_activity_at = Some(*now);
            },
            SessionAction::AssistantTurnRecorded {
                decoded_action,
                outcome,
                now,
            } => {
                state.turns.push(TurnRecord::assistant(outcome, decoded_action.clone(), *now));
                state.last_activity_at = Some(*now);
            },
            SessionAction::CartSnapshotUpdated { snapshot } => {
                state.cart = snapshot.clone();
            },
            SessionAction::ReservedLineAttached { product_id, variant_id } => {
                state.reserved_lines.insert((*product_id, *variant_id));
            },
            SessionAction::ReservedLineDetached { product_id, variant_id } => {
                state.reserved_lines.remove(&(*product_id, *variant_id));
            },
            SessionAction::UserLoggedIn { user_id } => {
                state.user_id = Some(*user_id);
            },
            SessionAction::PendingCheckoutSet {
                contact,
                shipping_address,
                billing_address,
            } => {
                state.pending_checkout = Some(PendingCheckout {
                    contact: contact.clone(),
                    shipping_address: shipping_address.clone(),
                    billing_address: billing_address.clone(),
                });
            },
            SessionAction::PendingCheckoutCleared => {
                state.pending_checkout = None;
            },
            SessionAction::StatusChanged { status, now } => {
                state.status = *status;
                state.last_activity_at = Some(*now);
            },
            SessionAction::ValidationFailed { error } => {
                state.last_error = Some(error.clone());
            },
            SessionAction::Create { .. }
            | SessionAction::RecordUserTurn { .. }
            | SessionAction::RecordAssistantTurn { .. }
            | SessionAction::UpdateCart { .. }
            | SessionAction::AttachReservedLine { .. }
            | SessionAction::DetachReservedLine { .. }
            | SessionAction::Login { .. }
            | SessionAction::Transition { .. }
            | SessionAction::SetPendingCheckout { .. }
            | SessionAction::ClearPendingCheckout
            | SessionAction::ExpireIfIdle { .. } => {},
        }
    }
}

impl Reducer for SessionReducer {
    type State = SessionState;
    type Action = SessionAction;
    type Environment = SessionEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            SessionAction::Create {
                session_id,
                user_id,
                currency,
                now,
            } => {
                if state.is_created() {
                    return SmallVec::new();
                }
                let event = SessionAction::Created {
                    session_id,
                    user_id,
                    currency,
                    now,
                };
                Self::apply_event(state, &event);
                let mut effects = Self::create_effects(event, env);
                effects.push(Self::schedule_idle_check(now, env));
                effects
            },

            SessionAction::RecordUserTurn { text, now } => {
                if state.status.is_terminal() {
                    let error = "session is terminal".to_string();
                    Self::apply_event(state, &SessionAction::ValidationFailed { error: error.clone() });
                    return SmallVec::new();
                }
                let event = SessionAction::UserTurnRecorded { text, now };
                Self::apply_event(state, &event);
                let mut effects = Self::create_effects(event, env);
                effects.push(Self::schedule_idle_check(now, env));
                effects
            },

            SessionAction::RecordAssistantTurn {
                decoded_action,
                outcome,
                now,
            } => {
                let event = SessionAction::AssistantTurnRecorded {
                    decoded_action,
                    outcome,
                    now,
                };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::UpdateCart { snapshot } => {
                let event = SessionAction::CartSnapshotUpdated { snapshot };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::AttachReservedLine { product_id, variant_id } => {
                if state.reserved_lines.contains(&(product_id, variant_id)) {
                    return SmallVec::new();
                }
                let event = SessionAction::ReservedLineAttached { product_id, variant_id };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::DetachReservedLine { product_id, variant_id } => {
                if !state.reserved_lines.contains(&(product_id, variant_id)) {
                    return SmallVec::new();
                }
                let event = SessionAction::ReservedLineDetached { product_id, variant_id };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::Login { user_id } => {
                if state.user_id == Some(user_id) {
                    return SmallVec::new();
                }
                let event = SessionAction::UserLoggedIn { user_id };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::SetPendingCheckout {
                contact,
                shipping_address,
                billing_address,
            } => {
                let event = SessionAction::PendingCheckoutSet {
                    contact,
                    shipping_address,
                    billing_address,
                };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::ClearPendingCheckout => {
                if state.pending_checkout.is_none() {
                    return SmallVec::new();
                }
                let event = SessionAction::PendingCheckoutCleared;
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::Transition { status, now } => {
                if state.status == status {
                    return SmallVec::new();
                }
                let event = SessionAction::StatusChanged { status, now };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            SessionAction::ExpireIfIdle {
                now,
                idle_timeout,
                absolute_ttl,
            } => {
                if state.status.is_terminal() {
                    return SmallVec::new();
                }

                let status = if let Some(created_at) = state.created_at {
                    let age = (now - created_at).to_std().unwrap_or_default();
                    if age >= absolute_ttl {
                        Some(SessionStatus::Expired)
                    } else {
                        None
                    }
                } else {
                    None
                };

                let status = status.or_else(|| {
                    let last_activity_at = state.last_activity_at?;
                    let elapsed = (now - last_activity_at).to_std().unwrap_or_default();
                    (elapsed >= idle_timeout).then_some(SessionStatus::Abandoned)
                });

                let Some(status) = status else {
                    return SmallVec::new();
                };

                let event = SessionAction::StatusChanged { status, now };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            // Replay path: events from the event store.
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}
