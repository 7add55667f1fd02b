//! Domain value types for the conversational shopping engine.
//!
//! Identifiers, cart snapshots, turn records, and the session record itself.
//! The reducers in [`crate::aggregates`] own the state-machine behavior; this
//! module only defines the shapes they pass around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque, caller-visible session identifier.
///
/// Unlike the other identifiers in this module this does not wrap a `Uuid`:
/// callers may generate their own session id (e.g. a cookie value), so the
/// only thing enforced here is the wire contract in spec: case-sensitive,
/// non-empty, at most 128 characters, URL-safe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

/// A `SessionId` failed validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSessionId {
    /// The identifier was empty.
    #[error("session id must not be empty")]
    Empty,
    /// The identifier exceeded the 128 character limit.
    #[error("session id exceeds 128 characters (got {0})")]
    TooLong(usize),
    /// The identifier contained a character outside the URL-safe alphabet.
    #[error("session id contains a character that is not URL-safe: {0:?}")]
    NotUrlSafe(char),
}

impl SessionId {
    /// Mints a new, server-generated session id (UUID-v4 rendered as a
    /// URL-safe string).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validates and wraps a caller-supplied session id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSessionId`] if the string is empty, too long, or
    /// contains characters outside `[A-Za-z0-9_.~-]`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidSessionId::Empty);
        }
        if raw.len() > 128 {
            return Err(InvalidSessionId::TooLong(raw.len()));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-')))
        {
            return Err(InvalidSessionId::NotUrlSafe(bad));
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a registered user, bindable to a session only via
/// an explicit login action (open question §9.1 in the source spec; not yet
/// part of the action catalog).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a `UserId` from a raw `Uuid`.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`.")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Creates a `", stringify!($name), "` from a raw `Uuid`.")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrows the inner `Uuid`.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(ProductId, "Identifier for a catalog product.");
uuid_id!(VariantId, "Identifier for a specific product variant (size, color, ...).");
uuid_id!(ReservationId, "Identifier for a single stock reservation.");
uuid_id!(OrderId, "Identifier for a placed order.");

// ============================================================================
// Session lifecycle
// ============================================================================

/// Lifecycle state of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting turns normally.
    Active,
    /// Terminated by a successful `ConfirmOrder`.
    Completed,
    /// Terminated by explicit `Cancel` or an inactivity timeout.
    Abandoned,
    /// Terminated by the absolute session TTL.
    Expired,
}

impl SessionStatus {
    /// Terminal states release any reservations still held by the session.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Role of the speaker that produced a [`TurnRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// The human on the other end of the conversation.
    User,
    /// The engine's reply.
    Assistant,
    /// A canned, non-model-generated system notice (e.g. reconnection banner).
    System,
}

/// Stable error codes surfaced to the user-visible side of a turn.
///
/// See the error-handling section of the source spec for the full
/// propagation rules; these are intentionally a closed, small set so
/// clients can render them without string matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// NLU model call failed or deadlined.
    NlUnavailable,
    /// NLU output could not be decoded into any catalog action.
    NlUndecodable,
    /// An optimistic cart update lost a race.
    CartConflict,
    /// Requested reservation quantity exceeds available stock.
    StockInsufficient,
    /// A reservation expired before it could be consumed.
    ReservationExpired,
    /// The order port rejected the supplied payment token.
    PaymentFailed,
    /// The turn arrived for a terminal or expired session.
    SessionExpired,
    /// Unexpected internal failure.
    Internal,
}

/// Structured outcome of executing one decoded [`crate::catalog::Action`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Plain-language assistant reply text.
    pub assistant_text: String,
    /// Product cards attached to the reply, if any.
    pub attached_products: Vec<ProductId>,
    /// Updated cart snapshot, if the action mutated the cart.
    pub cart_snapshot: Option<CartSnapshot>,
    /// Structured error, if the action failed.
    pub error: Option<ActionError>,
}

impl ActionOutcome {
    /// A reply with no attachments, no cart change, and no error.
    #[must_use]
    pub fn text(assistant_text: impl Into<String>) -> Self {
        Self {
            assistant_text: assistant_text.into(),
            attached_products: Vec::new(),
            cart_snapshot: None,
            error: None,
        }
    }

    /// A reply carrying a structured error; the assistant text is still the
    /// user-visible plain-language explanation.
    #[must_use]
    pub fn error(assistant_text: impl Into<String>, error: ActionError) -> Self {
        Self {
            assistant_text: assistant_text.into(),
            attached_products: Vec::new(),
            cart_snapshot: None,
            error: Some(error),
        }
    }
}

/// A stable error code plus the context needed to render it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionError {
    /// The stable code (§7 of the source spec).
    pub code: ErrorCode,
    /// Human-readable detail (e.g. "2 available").
    pub message: String,
}

/// One entry in a session's append-only conversation history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Who produced this turn.
    pub role: TurnRole,
    /// Raw text (user input, or the assistant's rendered reply).
    pub text: String,
    /// The action decoded from this turn, if this is a user turn that
    /// successfully decoded.
    pub decoded_action: Option<crate::catalog::Action>,
    /// The outcome of executing `decoded_action`, if any.
    pub action_outcome: Option<ActionOutcome>,
    /// When this turn was recorded.
    pub created_at: DateTime<Utc>,
}

impl TurnRecord {
    /// A user turn, prior to decoding.
    #[must_use]
    pub fn user(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            decoded_action: None,
            action_outcome: None,
            created_at,
        }
    }

    /// An assistant turn carrying the decoded action and its outcome.
    #[must_use]
    pub fn assistant(
        outcome: &ActionOutcome,
        decoded_action: Option<crate::catalog::Action>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: outcome.assistant_text.clone(),
            decoded_action,
            action_outcome: Some(outcome.clone()),
            created_at,
        }
    }

    /// A canned system notice, not produced by the model.
    #[must_use]
    pub fn system(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::System,
            text: text.into(),
            decoded_action: None,
            action_outcome: None,
            created_at,
        }
    }
}

// ============================================================================
// Cart
// ============================================================================

/// One line item in a [`CartSnapshot`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    /// The product this line refers to.
    pub product_id: ProductId,
    /// The specific variant, if the product has variants.
    pub variant_id: Option<VariantId>,
    /// Quantity of this line, 1..=99.
    pub quantity: u32,
    /// Unit price at the time the line was last priced.
    pub unit_price: u64,
    /// `unit_price * quantity`, in the same minor-unit currency.
    pub line_total: u64,
}

impl CartLine {
    /// Whether `product_id`/`variant_id` identify the same cart line as
    /// `self`.
    #[must_use]
    pub fn matches(&self, product_id: ProductId, variant_id: Option<VariantId>) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }
}

/// Server-computed snapshot of a session's working cart.
///
/// Prices are always recomputed server-side (open question §9.2): nothing
/// here is ever derived from client input.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CartSnapshot {
    /// Ordered line items; order is insertion order, stable across updates.
    pub lines: Vec<CartLine>,
    /// Sum of `line_total` across all lines.
    pub subtotal: u64,
    /// Computed tax.
    pub tax: u64,
    /// Computed shipping.
    pub shipping: u64,
    /// `subtotal + tax + shipping`.
    pub total: u64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Monotone counter; strictly increases on every cart-mutating action
    /// that commits (invariant 3 of the source spec).
    pub version: u64,
}

impl CartSnapshot {
    /// An empty cart priced in the given currency.
    #[must_use]
    pub fn empty(currency: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            subtotal: 0,
            tax: 0,
            shipping: 0,
            total: 0,
            currency: currency.into(),
            version: 0,
        }
    }

    /// Recomputes `subtotal`/`total` from `lines` (tax/shipping are left
    /// untouched; callers recompute those separately against the ports that
    /// own pricing policy).
    pub fn reprice(&mut self) {
        self.subtotal = self.lines.iter().map(|l| l.line_total).sum();
        self.total = self.subtotal + self.tax + self.shipping;
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// Lifecycle state of a [`Reservation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Holding stock against `expires_at`.
    Active,
    /// Consumed by a successful `ConfirmOrder`.
    Consumed,
    /// Released before expiry (explicit release or cart edit).
    Released,
    /// Reaped by the sweeper after `expires_at` elapsed.
    Expired,
}

/// A single stock hold backing one cart line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reservation {
    /// Identity of this reservation.
    pub reservation_id: ReservationId,
    /// Owning session.
    pub session_id: SessionId,
    /// Product this reservation holds stock for.
    pub product_id: ProductId,
    /// Variant, if any.
    pub variant_id: Option<VariantId>,
    /// Units held.
    pub quantity: u32,
    /// When the hold was created or last extended.
    pub created_at: DateTime<Utc>,
    /// When the hold lapses absent consumption or extension.
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: ReservationStatus,
}

// ============================================================================
// Events (Fan-out Hub payloads)
// ============================================================================

/// Events published through the Fan-out Hub (C7) to a session's attached
/// connections. Payload shape is otherwise opaque to the core per §6 of the
/// source spec; this enum is the payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Rendered assistant reply for this turn.
    AssistantMessage {
        /// The reply text.
        text: String,
    },
    /// Typing indicator toggled on/off around a turn.
    TypingIndicator {
        /// `true` while the turn is in flight.
        active: bool,
    },
    /// Structured product cards attached to an assistant turn.
    SuggestionsAttached {
        /// The suggested product ids.
        product_ids: Vec<ProductId>,
    },
    /// The working cart changed.
    CartUpdated {
        /// The new snapshot.
        snapshot: CartSnapshot,
    },
    /// A held reservation is about to lapse.
    ReservationExpiring {
        /// Seconds remaining before expiry.
        seconds_left: i64,
    },
    /// Checkout progressed to a new stage.
    CheckoutProgress {
        /// Human-readable stage description.
        stage: String,
    },
    /// A stable, user-visible error occurred.
    Error {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Read-model answer to the external `SessionSnapshot(session_id)` query
/// (§6): what a reconnecting client needs to resume without replaying the
/// full event stream itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Current working cart.
    pub cart: CartSnapshot,
    /// The most recent turns, oldest first, bounded by the configured
    /// history window.
    pub turns: Vec<TurnRecord>,
    /// Current lifecycle status.
    pub status: SessionStatus,
}

/// Wire envelope for one published event: `{ session_id, type, seq, payload }`.
///
/// `seq` is assigned at publish time under the session's turn lock and is
/// monotone per session (invariant 7 / §4.7 ordering guarantee).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopedEvent {
    /// Owning session.
    pub session_id: SessionId,
    /// Monotone per-session sequence number.
    pub seq: u64,
    /// The event payload.
    pub payload: EngineEvent,
}
