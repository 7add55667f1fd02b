//! Action Catalog (C3): the closed set of structured actions a decoded user
//! turn may resolve to, plus the semantic validator that sits between the
//! (untrusted) NLU Adapter output and the (trusted) Action Executor.
//!
//! Every path from prose to a state mutation passes through
//! [`Action::validate`] — that is the security boundary described in §9 of
//! the source spec. Nothing downstream trusts the shape of the model's
//! output directly.

use crate::types::{ProductId, VariantId};
use serde::{Deserialize, Serialize};

/// The closed set of actions the NLU Adapter may decode a user turn into.
///
/// Variants mirror the data model 1:1; see the module doc for the
/// validation boundary this enum sits behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// No actionable intent; small talk or an empty turn.
    Greet,
    /// The model needs more information before it can act.
    Clarify {
        /// What to ask the user.
        prompt: String,
    },
    /// Free-text product search.
    SearchProducts {
        /// The search query.
        query: String,
        /// Structured filters (price range, category, ...) as free-form
        /// key/value pairs; validated shape is catalog-port specific.
        filters: std::collections::BTreeMap<String, String>,
    },
    /// Attach specific product ids as suggestions (e.g. "show me that again").
    SuggestProducts {
        /// Ids to look up and attach.
        product_ids: Vec<ProductId>,
    },
    /// Add a line to the cart.
    AddToCart {
        /// Product to add.
        product_id: ProductId,
        /// Variant, if the product has variants.
        variant_id: Option<VariantId>,
        /// Units to add; must be in `1..=99`.
        quantity: u32,
    },
    /// Set a cart line to an explicit quantity; `0` removes the line.
    UpdateCartItem {
        /// Product line to update.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
        /// New quantity; must be in `0..=99`.
        quantity: u32,
    },
    /// Remove a cart line entirely.
    RemoveFromCart {
        /// Product line to remove.
        product_id: ProductId,
        /// Variant, if any.
        variant_id: Option<VariantId>,
    },
    /// Begin checkout with the given contact/address details.
    StartCheckout {
        /// Contact email or phone.
        contact: String,
        /// Shipping address, free-form for now (port validates structure).
        shipping_address: String,
        /// Billing address, defaults to shipping if omitted.
        billing_address: Option<String>,
    },
    /// Finalize the order with a payment token.
    ConfirmOrder {
        /// Opaque payment token from the client's payment flow.
        payment_token: String,
    },
    /// Abort an in-progress checkout and release any held reservations.
    Cancel,
}

/// How an action is classified for authorization/metrics purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionClass {
    /// No state mutation; safe to retry freely.
    ReadOnly,
    /// Mutates the working cart / reservations.
    CartMutating,
    /// Mutates checkout/order state.
    CheckoutMutating,
}

/// An action failed semantic validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ActionValidationError {
    /// `AddToCart`/`UpdateCartItem` quantity outside the allowed range.
    #[error("quantity {quantity} is outside the allowed range {min}..={max}")]
    QuantityOutOfRange {
        /// The rejected quantity.
        quantity: u32,
        /// Inclusive lower bound.
        min: u32,
        /// Inclusive upper bound.
        max: u32,
    },
    /// A required free-text field was empty.
    #[error("field `{field}` must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },
    /// `SuggestProducts`/`SearchProducts` asked for more than the allowed cap.
    #[error("requested {requested} items, at most {max} are allowed")]
    TooManyItems {
        /// Requested count.
        requested: usize,
        /// Allowed cap.
        max: usize,
    },
}

/// Maximum number of product ids `SuggestProducts` may carry in one turn.
pub const MAX_SUGGESTED_PRODUCTS: usize = 20;
/// Maximum number of results `SearchProducts` may return (Executor enforces
/// this independently; validation here only bounds the request shape).
pub const MAX_SEARCH_RESULTS: usize = 20;

impl Action {
    /// Classification used for authorization/metrics (§4.3).
    #[must_use]
    pub const fn class(&self) -> ActionClass {
        match self {
            Self::Greet | Self::Clarify { .. } | Self::SearchProducts { .. } | Self::SuggestProducts { .. } => {
                ActionClass::ReadOnly
            },
            Self::AddToCart { .. } | Self::UpdateCartItem { .. } | Self::RemoveFromCart { .. } | Self::Cancel => {
                ActionClass::CartMutating
            },
            Self::StartCheckout { .. } | Self::ConfirmOrder { .. } => ActionClass::CheckoutMutating,
        }
    }

    /// Cross-field semantic validation beyond what the JSON schema can
    /// express (the schema itself is expressed by [`Action::json_schema`]).
    ///
    /// # Errors
    ///
    /// Returns [`ActionValidationError`] on the first violated rule.
    pub fn validate(&self) -> Result<(), ActionValidationError> {
        match self {
            Self::AddToCart { quantity, .. } => {
                check_range(*quantity, 1, 99)?;
            },
            Self::UpdateCartItem { quantity, .. } => {
                check_range(*quantity, 0, 99)?;
            },
            Self::SuggestProducts { product_ids } => {
                if product_ids.len() > MAX_SUGGESTED_PRODUCTS {
                    return Err(ActionValidationError::TooManyItems {
                        requested: product_ids.len(),
                        max: MAX_SUGGESTED_PRODUCTS,
                    });
                }
            },
            Self::SearchProducts { query, .. } => {
                if query.trim().is_empty() {
                    return Err(ActionValidationError::EmptyField { field: "query" });
                }
            },
            Self::StartCheckout {
                contact,
                shipping_address,
                ..
            } => {
                if contact.trim().is_empty() {
                    return Err(ActionValidationError::EmptyField { field: "contact" });
                }
                if shipping_address.trim().is_empty() {
                    return Err(ActionValidationError::EmptyField {
                        field: "shipping_address",
                    });
                }
            },
            Self::ConfirmOrder { payment_token } => {
                if payment_token.trim().is_empty() {
                    return Err(ActionValidationError::EmptyField {
                        field: "payment_token",
                    });
                }
            },
            Self::Clarify { prompt } => {
                if prompt.trim().is_empty() {
                    return Err(ActionValidationError::EmptyField { field: "prompt" });
                }
            },
            Self::Greet | Self::RemoveFromCart { .. } | Self::Cancel => {},
        }
        Ok(())
    }

    /// The public JSON schema union published as part of the external
    /// contract (§6): this is what constrains the LM's structured output
    /// and what external clients may use to parse `decoded_action`
    /// metadata on assistant turns.
    ///
    /// Kept as a `serde_json::Value` rather than a generated schema crate
    /// so the exact shape (a `oneOf` tagged on `action`) is easy to audit
    /// by eye and to pass directly as an Anthropic tool's `input_schema`.
    #[must_use]
    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": [
                        "greet", "clarify", "search_products", "suggest_products",
                        "add_to_cart", "update_cart_item", "remove_from_cart",
                        "start_checkout", "confirm_order", "cancel"
                    ]
                },
                "prompt": { "type": "string" },
                "query": { "type": "string" },
                "filters": { "type": "object", "additionalProperties": { "type": "string" } },
                "product_ids": { "type": "array", "items": { "type": "string" } },
                "product_id": { "type": "string" },
                "variant_id": { "type": ["string", "null"] },
                "quantity": { "type": "integer", "minimum": 0, "maximum": 99 },
                "contact": { "type": "string" },
                "shipping_address": { "type": "string" },
                "billing_address": { "type": ["string", "null"] },
                "payment_token": { "type": "string" }
            },
            "required": ["action"]
        })
    }
}

const fn check_range(value: u32, min: u32, max: u32) -> Result<(), ActionValidationError> {
    if value < min || value > max {
        return Err(ActionValidationError::QuantityOutOfRange {
            quantity: value,
            min,
            max,
        });
    }
    Ok(())
}
