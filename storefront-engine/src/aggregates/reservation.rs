//! Reservation Ledger (C1).
//!
//! One aggregate instance (one event stream, one `Store`) per stock line —
//! a `(product_id, variant_id)` pair. This is the same sharding the
//! ticketing example uses for its inventory aggregate (one stream per
//! `(event_id, section)`), and for the same reason: reservation/release
//! traffic for unrelated products must never serialize behind each other.
//!
//! CRITICAL invariant (mirrors the ticketing "last seat" check): available
//! capacity is `on_hand - sum(active reservation quantities)`, never just
//! `on_hand - sold`. [`ReservationReducer::validate_reserve`] is where
//! oversell is prevented.
//!
//! `Consume` is all-or-nothing *within one line* here; a checkout spanning
//! several lines is consumed by the Action Executor issuing one `Consume`
//! call per line, locking lines in sorted `(product_id, variant_id)` order
//! and unwinding (re-releasing already-consumed lines is not possible once
//! committed, so the Executor instead validates availability across every
//! line before issuing any `Consume` — see `executor.rs`).

use crate::types::{ProductId, ReservationId, ReservationStatus, SessionId, VariantId};
use chrono::{DateTime, Utc};
use composable_rust_core::{
    append_events, delay, effect::Effect, environment::Clock, event_bus::EventBus,
    event_store::EventStore, publish_event, reducer::Reducer, smallvec, stream::StreamId, SmallVec,
};
use composable_rust_macros::Action;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Stream id for the reservation line identified by `(product_id, variant_id)`.
#[must_use]
pub fn line_stream_id(product_id: ProductId, variant_id: Option<VariantId>) -> StreamId {
    match variant_id {
        Some(variant_id) => StreamId::new(format!("reservation-line-{product_id}-{variant_id}")),
        None => StreamId::new(format!("reservation-line-{product_id}")),
    }
}

// ============================================================================
// State
// ============================================================================

/// State of a single reservation line.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReservationLineState {
    /// Units physically on hand for this line.
    pub on_hand: u32,
    /// Units sold (consumed into a confirmed order).
    pub sold: u32,
    /// All reservations ever created for this line, keyed by id. Terminal
    /// reservations are retained (not removed) so `Release`/`Consume` stay
    /// idempotent against a reservation that has already settled.
    pub reservations: HashMap<ReservationId, crate::types::Reservation>,
    /// Last validation failure, surfaced to tests and diagnostics.
    pub last_error: Option<String>,
}

impl ReservationLineState {
    /// Units held by active reservations.
    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active)
            .map(|r| r.quantity)
            .sum()
    }

    /// `on_hand - reserved` (sold stock is already excluded from `on_hand`
    /// once consumed — see `apply_event` for `Consumed`).
    #[must_use]
    pub fn available(&self) -> u32 {
        self.on_hand.saturating_sub(self.reserved())
    }

    /// The session's existing active reservation on this line, if any
    /// (invariant 5: at most one active reservation per session per line).
    #[must_use]
    pub fn active_reservation_for(&self, session_id: &SessionId) -> Option<&crate::types::Reservation> {
        self.reservations
            .values()
            .find(|r| r.session_id == *session_id && r.status == ReservationStatus::Active)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Commands and events for the Reservation Ledger aggregate.
#[derive(Action, Clone, Debug, Serialize, Deserialize)]
pub enum ReservationAction {
    // ---- Commands ----
    /// Set (or reset) the on-hand count for this line. Used to seed a line
    /// the first time it is touched; in production this would be populated
    /// from the product catalog's stock feed.
    #[command]
    SeedStock {
        /// Product this line belongs to.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
        /// New on-hand count.
        on_hand: u32,
    },

    /// Reserve (or extend) a hold for `session_id` on this line.
    #[command]
    Reserve {
        /// Identity of the new reservation (ignored if this is an
        /// extension of an existing active reservation for the session).
        reservation_id: ReservationId,
        /// Owning session.
        session_id: SessionId,
        /// Product this line belongs to.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
        /// Requested quantity (the new total for an extension, not a delta).
        quantity: u32,
        /// TTL to apply from now.
        ttl: std::time::Duration,
    },

    /// Idempotent release; no-op if already terminal.
    #[command]
    Release {
        /// Reservation to release.
        reservation_id: ReservationId,
    },

    /// Idempotent release of every active reservation held by a session on
    /// this line.
    #[command]
    ReleaseAllForSession {
        /// Session whose holds should be released.
        session_id: SessionId,
    },

    /// All-or-nothing consumption of the given reservations (all must
    /// belong to this line and be active).
    #[command]
    Consume {
        /// Reservations to consume.
        reservation_ids: Vec<ReservationId>,
    },

    /// Mark every active reservation with `expires_at <= now` as expired.
    #[command]
    ReapExpired {
        /// Sweep timestamp.
        now: DateTime<Utc>,
    },

    // ---- Events ----
    /// The line's on-hand count was (re)set.
    #[event]
    StockSeeded {
        /// Product this line belongs to.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
        /// New on-hand count.
        on_hand: u32,
    },

    /// A new reservation was created.
    #[event]
    Reserved {
        /// New reservation's id.
        reservation_id: ReservationId,
        /// Owning session.
        session_id: SessionId,
        /// Product this line belongs to.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
        /// Units held.
        quantity: u32,
        /// When created.
        created_at: DateTime<Utc>,
        /// When it lapses.
        expires_at: DateTime<Utc>,
    },

    /// An existing reservation was extended (quantity and/or expiry).
    #[event]
    Extended {
        /// Reservation extended.
        reservation_id: ReservationId,
        /// New total quantity.
        quantity: u32,
        /// New expiry.
        expires_at: DateTime<Utc>,
    },

    /// A reservation was released (explicitly, or as part of a session-wide
    /// release).
    #[event]
    Released {
        /// Reservation released.
        reservation_id: ReservationId,
    },

    /// A reservation lapsed via the sweeper.
    #[event]
    Expired {
        /// Reservation that lapsed.
        reservation_id: ReservationId,
    },

    /// A batch of reservations was atomically consumed.
    #[event]
    Consumed {
        /// Reservations consumed.
        reservation_ids: Vec<ReservationId>,
        /// Total units moved from reserved to sold.
        quantity: u32,
    },

    /// A `Reserve`/extension request could not be satisfied.
    #[event]
    InsufficientStock {
        /// Units requested.
        requested: u32,
        /// Units actually available at decision time.
        available: u32,
    },

    /// A command failed validation for a reason other than stock.
    #[event]
    ValidationFailed {
        /// Error message.
        error: String,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the Reservation Ledger aggregate.
#[derive(Clone)]
pub struct ReservationEnvironment {
    /// Clock for timestamps.
    pub clock: Arc<dyn Clock>,
    /// Event store for persistence.
    pub event_store: Arc<dyn EventStore>,
    /// Event bus for publishing.
    pub event_bus: Arc<dyn EventBus>,
    /// Stream id for this line instance.
    pub stream_id: StreamId,
}

impl ReservationEnvironment {
    /// Creates a new `ReservationEnvironment`.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
        stream_id: StreamId,
    ) -> Self {
        Self {
            clock,
            event_store,
            event_bus,
            stream_id,
        }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the Reservation Ledger aggregate.
#[derive(Clone, Debug, Default)]
pub struct ReservationReducer;

impl ReservationReducer {
    /// Creates a new `ReservationReducer`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn create_effects(
        event: ReservationAction,
        env: &ReservationEnvironment,
    ) -> SmallVec<[Effect<ReservationAction>; 4]> {
        let Ok(data) = bincode::serialize(&event) else {
            return SmallVec::new();
        };
        let serialized = composable_rust_core::event::SerializedEvent::new(
            event.event_type().to_string(),
            data,
            None,
        );

        smallvec![
            append_events! {
                store: env.event_store,
                stream: env.stream_id.as_str(),
                expected_version: None,
                events: vec![serialized.clone()],
                on_success: |_version| None,
                on_error: |error| Some(ReservationAction::ValidationFailed {
                    error: error.to_string()
                })
            },
            publish_event! {
                bus: env.event_bus,
                topic: "reservation-events",
                event: serialized,
                on_success: || None,
                on_error: |error| Some(ReservationAction::ValidationFailed {
                    error: error.to_string()
                })
            }
        ]
    }

    /// CRITICAL: prevents oversell. `extra_needed` is the net additional
    /// quantity this request would hold beyond what the session already
    /// holds active on this line (zero or negative for a same-or-smaller
    /// extension, which can never be rejected on stock grounds).
    fn validate_reserve(state: &ReservationLineState, extra_needed: i64) -> Result<(), (u32, u32)> {
        if extra_needed <= 0 {
            return Ok(());
        }
        #[allow(clippy::cast_sign_loss)]
        let extra_needed = extra_needed as u32;
        let available = state.available();
        if available < extra_needed {
            return Err((extra_needed, available));
        }
        Ok(())
    }

    fn apply_event(state: &mut ReservationLineState, event: &ReservationAction) {
        match event {
            ReservationAction::StockSeeded { on_hand, .. } => {
                state.on_hand = *on_hand;
                state.last_error = None;
            },
            ReservationAction::Reserved {
                reservation_id,
                session_id,
                product_id,
                variant_id,
                quantity,
                created_at,
                expires_at,
            } => {
                state.reservations.insert(
                    *reservation_id,
                    crate::types::Reservation {
                        reservation_id: *reservation_id,
                        session_id: session_id.clone(),
                        product_id: *product_id,
                        variant_id: *variant_id,
                        quantity: *quantity,
                        created_at: *created_at,
                        expires_at: *expires_at,
                        status: ReservationStatus::Active,
                    },
                );
                state.last_error = None;
            },
            ReservationAction::Extended {
                reservation_id,
                quantity,
                expires_at,
            } => {
                if let Some(reservation) = state.reservations.get_mut(reservation_id) {
                    reservation.quantity = *quantity;
                    reservation.expires_at = *expires_at;
                }
                state.last_error = None;
            },
            ReservationAction::Released { reservation_id } => {
                if let Some(reservation) = state.reservations.get_mut(reservation_id) {
                    reservation.status = ReservationStatus::Released;
                }
                state.last_error = None;
            },
            ReservationAction::Expired { reservation_id } => {
                if let Some(reservation) = state.reservations.get_mut(reservation_id) {
                    reservation.status = ReservationStatus::Expired;
                }
                state.last_error = None;
            },
            ReservationAction::Consumed {
                reservation_ids,
                quantity,
            } => {
                for id in reservation_ids {
                    if let Some(reservation) = state.reservations.get_mut(id) {
                        reservation.status = ReservationStatus::Consumed;
                    }
                }
                state.sold += quantity;
                state.on_hand = state.on_hand.saturating_sub(*quantity);
                state.last_error = None;
            },
            ReservationAction::ValidationFailed { error } => {
                state.last_error = Some(error.clone());
            },
            ReservationAction::InsufficientStock { .. } => {},
            ReservationAction::SeedStock { .. }
            | ReservationAction::Reserve { .. }
            | ReservationAction::Release { .. }
            | ReservationAction::ReleaseAllForSession { .. }
            | ReservationAction::Consume { .. }
            | ReservationAction::ReapExpired { .. } => {},
        }
    }
}

impl Reducer for ReservationReducer {
    type State = ReservationLineState;
    type Action = ReservationAction;
    type Environment = ReservationEnvironment;

    #[allow(clippy::too_many_lines)]
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            ReservationAction::SeedStock {
                product_id,
                variant_id,
                on_hand,
            } => {
                let event = ReservationAction::StockSeeded {
                    product_id,
                    variant_id,
                    on_hand,
                };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            ReservationAction::Reserve {
                reservation_id,
                session_id,
                product_id,
                variant_id,
                quantity,
                ttl,
            } => {
                if quantity == 0 || quantity > 99 {
                    let error = format!("quantity {quantity} is outside 1..=99");
                    Self::apply_event(state, &ReservationAction::ValidationFailed { error: error.clone() });
                    return SmallVec::new();
                }

                let existing = state.active_reservation_for(&session_id).cloned();
                let extra_needed = i64::from(quantity) - existing.as_ref().map_or(0, |r| i64::from(r.quantity));

                if let Err((requested, available)) = Self::validate_reserve(state, extra_needed) {
                    let event = ReservationAction::InsufficientStock { requested, available };
                    Self::apply_event(state, &event);
                    return SmallVec::new();
                }

                let now = env.clock.now();
                let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();

                let event = if let Some(existing) = existing {
                    ReservationAction::Extended {
                        reservation_id: existing.reservation_id,
                        quantity,
                        expires_at,
                    }
                } else {
                    ReservationAction::Reserved {
                        reservation_id,
                        session_id,
                        product_id,
                        variant_id,
                        quantity,
                        created_at: now,
                        expires_at,
                    }
                };
                Self::apply_event(state, &event);

                let mut effects = Self::create_effects(event, env);
                let timeout = (expires_at - now).to_std().unwrap_or_default();
                effects.push(delay! {
                    duration: timeout,
                    action: ReservationAction::ReapExpired { now: expires_at }
                });
                effects
            },

            ReservationAction::Release { reservation_id } => {
                let Some(reservation) = state.reservations.get(&reservation_id) else {
                    return SmallVec::new();
                };
                if reservation.status != ReservationStatus::Active {
                    return SmallVec::new();
                }
                let event = ReservationAction::Released { reservation_id };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            ReservationAction::ReleaseAllForSession { session_id } => {
                let ids: Vec<ReservationId> = state
                    .reservations
                    .values()
                    .filter(|r| r.session_id == session_id && r.status == ReservationStatus::Active)
                    .map(|r| r.reservation_id)
                    .collect();

                let mut effects = SmallVec::new();
                for reservation_id in ids {
                    let event = ReservationAction::Released { reservation_id };
                    Self::apply_event(state, &event);
                    effects.extend(Self::create_effects(event, env));
                }
                effects
            },

            ReservationAction::Consume { reservation_ids } => {
                if reservation_ids.is_empty() {
                    return SmallVec::new();
                }
                let all_active = reservation_ids
                    .iter()
                    .all(|id| state.reservations.get(id).is_some_and(|r| r.status == ReservationStatus::Active));
                if !all_active {
                    let error = "one or more reservations are not active".to_string();
                    Self::apply_event(state, &ReservationAction::ValidationFailed { error });
                    return SmallVec::new();
                }
                let quantity: u32 = reservation_ids
                    .iter()
                    .filter_map(|id| state.reservations.get(id))
                    .map(|r| r.quantity)
                    .sum();
                let event = ReservationAction::Consumed {
                    reservation_ids,
                    quantity,
                };
                Self::apply_event(state, &event);
                Self::create_effects(event, env)
            },

            ReservationAction::ReapExpired { now } => {
                let expired: Vec<ReservationId> = state
                    .reservations
                    .values()
                    .filter(|r| r.status == ReservationStatus::Active && r.expires_at <= now)
                    .map(|r| r.reservation_id)
                    .collect();

                let mut effects = SmallVec::new();
                for reservation_id in expired {
                    let event = ReservationAction::Expired { reservation_id };
                    Self::apply_event(state, &event);
                    effects.extend(Self::create_effects(event, env));
                }
                effects
            },

            // Replay path: events from the event store.
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use composable_rust_core::environment::SystemClock;
    use composable_rust_testing::mocks::{InMemoryEventBus, InMemoryEventStore};

    fn env() -> ReservationEnvironment {
        ReservationEnvironment::new(
            Arc::new(SystemClock),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
            StreamId::new("reservation-line-test"),
        )
    }

    #[test]
    fn reserve_succeeds_within_stock() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState::default();
        reducer.reduce(
            &mut state,
            ReservationAction::SeedStock {
                product_id: ProductId::new(),
                variant_id: None,
                on_hand: 5,
            },
            &env,
        );

        let product_id = state.reservations.values().next().map_or_else(ProductId::new, |r| r.product_id);
        let session_id = SessionId::generate();
        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: session_id.clone(),
                product_id,
                variant_id: None,
                quantity: 3,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );

        assert_eq!(state.reserved(), 3);
        assert_eq!(state.available(), 2);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn reserve_prevents_oversell_on_last_unit() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState {
            on_hand: 1,
            ..Default::default()
        };
        let product_id = ProductId::new();

        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: SessionId::generate(),
                product_id,
                variant_id: None,
                quantity: 1,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );
        assert_eq!(state.reserved(), 1);

        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: SessionId::generate(),
                product_id,
                variant_id: None,
                quantity: 1,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );

        // CRITICAL: still only one unit reserved, not two.
        assert_eq!(state.reserved(), 1);
        assert!(state.last_error.is_none()); // InsufficientStock is informational, not an error string
    }

    #[test]
    fn second_add_to_cart_for_same_line_extends_not_duplicates() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState {
            on_hand: 10,
            ..Default::default()
        };
        let product_id = ProductId::new();
        let session_id = SessionId::generate();

        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: session_id.clone(),
                product_id,
                variant_id: None,
                quantity: 2,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );
        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: session_id.clone(),
                product_id,
                variant_id: None,
                quantity: 5,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );

        let active: Vec<_> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Active)
            .collect();
        assert_eq!(active.len(), 1, "extension must not create a second reservation");
        assert_eq!(active[0].quantity, 5);
        assert_eq!(state.reserved(), 5);
    }

    #[test]
    fn release_is_idempotent() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState {
            on_hand: 5,
            ..Default::default()
        };
        let reservation_id = ReservationId::new();
        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id,
                session_id: SessionId::generate(),
                product_id: ProductId::new(),
                variant_id: None,
                quantity: 2,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );
        reducer.reduce(&mut state, ReservationAction::Release { reservation_id }, &env);
        assert_eq!(state.available(), 5);
        // Second release is a no-op, not an error.
        let effects = reducer.reduce(&mut state, ReservationAction::Release { reservation_id }, &env);
        assert!(effects.is_empty());
        assert_eq!(state.available(), 5);
    }

    #[test]
    fn consume_is_all_or_nothing() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState {
            on_hand: 5,
            ..Default::default()
        };
        let active_id = ReservationId::new();
        let already_released_id = ReservationId::new();

        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id: active_id,
                session_id: SessionId::generate(),
                product_id: ProductId::new(),
                variant_id: None,
                quantity: 2,
                ttl: std::time::Duration::from_secs(600),
            },
            &env,
        );

        // Consume referencing a reservation that doesn't exist must fail
        // entirely, leaving the valid one untouched.
        reducer.reduce(
            &mut state,
            ReservationAction::Consume {
                reservation_ids: vec![active_id, already_released_id],
            },
            &env,
        );

        assert_eq!(
            state.reservations.get(&active_id).unwrap().status,
            ReservationStatus::Active,
            "partial consume must leave every input reservation in its prior state"
        );
    }

    #[test]
    fn reap_expired_releases_lapsed_reservations() {
        let reducer = ReservationReducer::new();
        let env = env();
        let mut state = ReservationLineState {
            on_hand: 3,
            ..Default::default()
        };
        let reservation_id = ReservationId::new();
        let now = Utc::now();
        reducer.reduce(
            &mut state,
            ReservationAction::Reserve {
                reservation_id,
                session_id: SessionId::generate(),
                product_id: ProductId::new(),
                variant_id: None,
                quantity: 1,
                ttl: std::time::Duration::from_secs(1),
            },
            &env,
        );

        reducer.reduce(
            &mut state,
            ReservationAction::ReapExpired {
                now: now + chrono::Duration::seconds(10),
            },
            &env,
        );

        assert_eq!(state.reservations.get(&reservation_id).unwrap().status, ReservationStatus::Expired);
        assert_eq!(state.available(), 3);
    }
}
