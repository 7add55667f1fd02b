//! Outbound ports (§6): the boundary the engine's core crosses to reach the
//! rest of the commerce stack. Concrete adapters (HTTP clients, DB-backed
//! catalogs, payment gateways) live outside this crate per the spec's
//! non-goals; these traits are what the Action Executor and NLU Adapter are
//! generic over.
//!
//! Dyn-compatible via `Pin<Box<dyn Future>>` returns, matching the
//! `EventStore`/`EventBus` pattern the rest of the workspace uses.

use crate::types::{CartSnapshot, OrderId, ProductId, VariantId};
use std::future::Future;
use std::pin::Pin;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A minimal, read-only product summary as returned by catalog search/lookup.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProductSummary {
    /// Product identity.
    pub product_id: ProductId,
    /// Display name.
    pub name: String,
    /// Current price in minor units.
    pub price: u64,
    /// Units currently on hand, across all variants.
    pub on_hand: u32,
}

/// Errors a port adapter may raise; the Action Executor translates every
/// variant here into one of the stable codes in [`crate::types::ErrorCode`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    /// The adapter could not reach its backing service in time.
    #[error("port call timed out")]
    Timeout,
    /// The backing service returned a well-formed rejection.
    #[error("port call rejected: {0}")]
    Rejected(String),
    /// Anything else; treated as [`crate::types::ErrorCode::Internal`].
    #[error("port call failed: {0}")]
    Other(String),
}

/// Outbound product catalog port.
pub trait ProductCatalog: Send + Sync {
    /// Free-text search, capped server-side at
    /// [`crate::catalog::MAX_SEARCH_RESULTS`] regardless of `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the backing catalog is unavailable.
    fn search(
        &self,
        query: &str,
        filters: &std::collections::BTreeMap<String, String>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ProductSummary>, PortError>>;

    /// Read-through lookup for a known set of ids.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the backing catalog is unavailable.
    fn get_many(&self, ids: &[ProductId]) -> BoxFuture<'_, Result<Vec<ProductSummary>, PortError>>;
}

/// Outbound cart port: the system of record for priced line items, as
/// distinct from the reservation ledger (C1), which tracks stock holds.
pub trait Cart: Send + Sync {
    /// Current snapshot for a session.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the cart service is unavailable.
    fn get(&self, session_id: &str) -> BoxFuture<'_, Result<CartSnapshot, PortError>>;

    /// Upsert a single line (add, or set its quantity if already present).
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Rejected`] on an optimistic-concurrency loss
    /// (`CART_CONFLICT`), or [`PortError::Other`]/[`PortError::Timeout`] for
    /// transient failures.
    fn upsert(
        &self,
        session_id: &str,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
    ) -> BoxFuture<'_, Result<CartSnapshot, PortError>>;

    /// Remove a line entirely.
    ///
    /// # Errors
    ///
    /// Returns [`PortError`] if the cart service is unavailable.
    fn remove(
        &self,
        session_id: &str,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> BoxFuture<'_, Result<CartSnapshot, PortError>>;
}

/// Outbound order port. `create` is expected to be transactional: charge,
/// consume reservations, and write the order row atomically, unwinding on
/// any failure (§4.6).
pub trait Order: Send + Sync {
    /// Finalize an order for the given cart against a payment token.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Rejected`] on payment rejection
    /// (`PAYMENT_FAILED`), or [`PortError::Other`]/[`PortError::Timeout`]
    /// for transient failures.
    fn create(
        &self,
        session_id: &str,
        cart: &CartSnapshot,
        shipping_address: &str,
        billing_address: &str,
        payment_token: &str,
    ) -> BoxFuture<'_, Result<OrderId, PortError>>;
}

/// Outbound language-model port used by the NLU Adapter (C4).
///
/// `complete` must itself respect `deadline` as a hard wall-clock budget;
/// the adapter does not apply a second timeout on top.
pub trait LanguageModel: Send + Sync {
    /// Run one structured-output completion.
    ///
    /// `schema` constrains the returned JSON to the Action Catalog's schema
    /// union; `prompt` is the fully composed prompt (system preamble plus
    /// history window plus cart snapshot plus user text).
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Timeout`] if the deadline elapses, or
    /// [`PortError::Other`] for any other failure reaching the model.
    fn complete(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        deadline: std::time::Duration,
    ) -> BoxFuture<'_, Result<serde_json::Value, PortError>>;
}
