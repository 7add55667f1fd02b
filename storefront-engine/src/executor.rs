//! Action Executor (C6).
//!
//! Carries out one validated [`Action`] against the outbound ports and the
//! Reservation Ledger, and translates whatever comes back into a single
//! [`ActionOutcome`]. This is the only module that touches [`Cart`],
//! [`Order`], [`ProductCatalog`], or a reservation line's `Store` directly —
//! the Dialogue Controller only ever sees the outcome plus any resulting
//! cart snapshot.
//!
//! Multi-line operations (`StartCheckout`, `Cancel`) touch reservation lines
//! in sorted `(product_id, variant_id)` order, matching the lock ordering
//! documented on [`crate::aggregates::reservation`].

use crate::aggregates::reservation::{
    line_stream_id, ReservationAction, ReservationEnvironment, ReservationLineState, ReservationReducer,
};
use crate::aggregates::session::PendingCheckout;
use crate::catalog::Action;
use crate::ports::{Cart, Order, PortError, ProductCatalog};
use crate::registry::AggregateRegistry;
use crate::types::{
    ActionError, ActionOutcome, CartLine, CartSnapshot, ErrorCode, ProductId, ReservationId, ReservationStatus, SessionId, VariantId,
};
use composable_rust_core::environment::Clock;
use composable_rust_core::event_bus::EventBus;
use composable_rust_core::event_store::EventStore;
use std::sync::Arc;
use std::time::Duration;

type LineKey = (ProductId, Option<VariantId>);
type LineRegistry = AggregateRegistry<LineKey, ReservationLineState, ReservationAction, ReservationEnvironment, ReservationReducer>;

/// Outcome of attempting to hold stock for one cart line.
enum HoldResult {
    /// The full requested quantity is now actively reserved.
    Held,
    /// Stock was insufficient; the hold was not created or extended.
    Insufficient {
        /// Units requested.
        requested: u32,
        /// Units actually available.
        available: u32,
    },
}

/// Carries out decoded actions against the commerce stack.
pub struct ActionExecutor {
    catalog: Arc<dyn ProductCatalog>,
    cart: Arc<dyn Cart>,
    order: Arc<dyn Order>,
    lines: LineRegistry,
    clock: Arc<dyn Clock>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<dyn EventBus>,
}

impl ActionExecutor {
    /// Creates a new executor wired to the given outbound ports.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        cart: Arc<dyn Cart>,
        order: Arc<dyn Order>,
        clock: Arc<dyn Clock>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            catalog,
            cart,
            order,
            lines: LineRegistry::new(),
            clock,
            event_store,
            event_bus,
        }
    }

    /// Returns the per-line `Store`, creating it on first touch. Exposed at
    /// `pub(crate)` so the Dialogue Controller's tests can seed stock
    /// directly without going through a full `ProductCatalog` port.
    pub(crate) async fn line_store(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Arc<composable_rust_runtime::Store<ReservationLineState, ReservationAction, ReservationEnvironment, ReservationReducer>>
    {
        let clock = Arc::clone(&self.clock);
        let event_store = Arc::clone(&self.event_store);
        let event_bus = Arc::clone(&self.event_bus);
        self.lines
            .get_or_create((product_id, variant_id), move |_| {
                ReservationEnvironment::new(clock, event_store, event_bus, line_stream_id(product_id, variant_id))
            })
            .await
    }

    /// Attempts to hold `quantity` units of `(product_id, variant_id)` for
    /// `session_id`, extending any existing active hold rather than
    /// stacking a second one.
    async fn hold(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
        ttl: Duration,
    ) -> HoldResult {
        let store = self.line_store(product_id, variant_id).await;

        store
            .send(ReservationAction::Reserve {
                reservation_id: ReservationId::new(),
                session_id: session_id.clone(),
                product_id,
                variant_id,
                quantity,
                ttl,
            })
            .await;

        let (held_for_session, available) = store
            .state(|s| (s.active_reservation_for(session_id).map(|r| r.quantity), s.available()))
            .await;

        match held_for_session {
            Some(held) if held == quantity => HoldResult::Held,
            _ => HoldResult::Insufficient {
                requested: quantity,
                available,
            },
        }
    }

    async fn release_line(&self, session_id: &SessionId, product_id: ProductId, variant_id: Option<VariantId>) {
        let store = self.line_store(product_id, variant_id).await;
        store
            .send(ReservationAction::ReleaseAllForSession {
                session_id: session_id.clone(),
            })
            .await;
    }

    /// Upserts a cart line, retrying exactly once against a freshly fetched
    /// snapshot if the first attempt lost an optimistic-concurrency race.
    async fn upsert_cart_line(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
    ) -> Result<CartSnapshot, ActionOutcome> {
        match self.cart.upsert(session_id.as_str(), product_id, variant_id, quantity).await {
            Ok(snapshot) => Ok(snapshot),
            Err(PortError::Rejected(_)) => {
                let _ = self.cart.get(session_id.as_str()).await;
                self.cart
                    .upsert(session_id.as_str(), product_id, variant_id, quantity)
                    .await
                    .map_err(cart_conflict_or_port_error)
            },
            Err(error) => Err(port_error_outcome("I couldn't update your cart.", &error)),
        }
    }

    /// Removes a cart line, retrying exactly once against a freshly fetched
    /// snapshot if the first attempt lost an optimistic-concurrency race.
    async fn remove_cart_line(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<CartSnapshot, ActionOutcome> {
        match self.cart.remove(session_id.as_str(), product_id, variant_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(PortError::Rejected(_)) => {
                let _ = self.cart.get(session_id.as_str()).await;
                self.cart
                    .remove(session_id.as_str(), product_id, variant_id)
                    .await
                    .map_err(cart_conflict_or_port_error)
            },
            Err(error) => Err(port_error_outcome("I couldn't update your cart.", &error)),
        }
    }

    /// Ensures `line`'s reservation is consumed for `session_id`, re-reserving
    /// and retrying once if the reservation it was holding has lapsed (§7
    /// `RESERVATION_EXPIRED`).
    async fn consume_line(&self, session_id: &SessionId, line: &CartLine, checkout_ttl: Duration) -> Result<(), ActionOutcome> {
        let store = self.line_store(line.product_id, line.variant_id).await;

        let active = store.state(|s| s.active_reservation_for(session_id).map(|r| r.reservation_id)).await;
        if let Some(reservation_id) = active {
            store
                .send(ReservationAction::Consume {
                    reservation_ids: vec![reservation_id],
                })
                .await;
            let consumed = store
                .state(|s| s.reservations.get(&reservation_id).map(|r| r.status))
                .await
                == Some(ReservationStatus::Consumed);
            if consumed {
                return Ok(());
            }
        }

        // The reservation had already lapsed (or was never seen active).
        // Re-reserve once and retry Consume once before giving up.
        match self.hold(session_id, line.product_id, line.variant_id, line.quantity, checkout_ttl).await {
            HoldResult::Insufficient { requested, available } => Err(ActionOutcome::error(
                "One of your items is no longer available in that quantity.",
                ActionError {
                    code: ErrorCode::StockInsufficient,
                    message: format!("requested {requested}, available {available}"),
                },
            )),
            HoldResult::Held => {
                let Some(retry_id) = store.state(|s| s.active_reservation_for(session_id).map(|r| r.reservation_id)).await else {
                    return Err(reservation_expired_outcome());
                };
                store
                    .send(ReservationAction::Consume {
                        reservation_ids: vec![retry_id],
                    })
                    .await;
                let consumed = store.state(|s| s.reservations.get(&retry_id).map(|r| r.status)).await == Some(ReservationStatus::Consumed);
                if consumed {
                    Ok(())
                } else {
                    Err(reservation_expired_outcome())
                }
            },
        }
    }

    /// Executes `action` for `session_id` against `cart_before`, returning
    /// the resulting [`ActionOutcome`].
    #[allow(clippy::too_many_lines)]
    pub async fn apply(
        &self,
        session_id: &SessionId,
        cart_before: &CartSnapshot,
        pending_checkout: Option<&PendingCheckout>,
        action: &Action,
        soft_cart_ttl: Duration,
        checkout_ttl: Duration,
    ) -> ActionOutcome {
        match action {
            Action::Greet => ActionOutcome::text("Hi! What are you looking for today?"),

            Action::Clarify { prompt } => ActionOutcome::text(prompt.clone()),

            Action::SearchProducts { query, filters } => match self.catalog.search(query, filters, crate::catalog::MAX_SEARCH_RESULTS).await {
                Ok(products) => {
                    let mut outcome = ActionOutcome::text(format!("Found {} result(s) for \"{query}\".", products.len()));
                    outcome.attached_products = products.into_iter().map(|p| p.product_id).collect();
                    outcome
                },
                Err(error) => port_error_outcome("I couldn't search the catalog right now.", &error),
            },

            Action::SuggestProducts { product_ids } => match self.catalog.get_many(product_ids).await {
                Ok(products) => {
                    let mut outcome = ActionOutcome::text("Here you go.");
                    outcome.attached_products = products.into_iter().map(|p| p.product_id).collect();
                    outcome
                },
                Err(error) => port_error_outcome("I couldn't look those up right now.", &error),
            },

            Action::AddToCart {
                product_id,
                variant_id,
                quantity,
            } => {
                match self.hold(session_id, *product_id, *variant_id, *quantity, soft_cart_ttl).await {
                    HoldResult::Held => match self.upsert_cart_line(session_id, *product_id, *variant_id, *quantity).await {
                        Ok(mut snapshot) => {
                            snapshot.version = cart_before.version + 1;
                            ActionOutcome {
                                assistant_text: "Added to your cart.".to_string(),
                                attached_products: Vec::new(),
                                cart_snapshot: Some(snapshot),
                                error: None,
                            }
                        },
                        Err(outcome) => {
                            self.release_line(session_id, *product_id, *variant_id).await;
                            outcome
                        },
                    },
                    HoldResult::Insufficient { requested, available } => ActionOutcome::error(
                        format!("Only {available} of that item are available right now."),
                        ActionError {
                            code: ErrorCode::StockInsufficient,
                            message: format!("requested {requested}, available {available}"),
                        },
                    ),
                }
            },

            Action::UpdateCartItem {
                product_id,
                variant_id,
                quantity,
            } if *quantity == 0 => {
                self.release_line(session_id, *product_id, *variant_id).await;
                match self.remove_cart_line(session_id, *product_id, *variant_id).await {
                    Ok(mut snapshot) => {
                        snapshot.version = cart_before.version + 1;
                        ActionOutcome {
                            assistant_text: "Removed from your cart.".to_string(),
                            attached_products: Vec::new(),
                            cart_snapshot: Some(snapshot),
                            error: None,
                        }
                    },
                    Err(outcome) => outcome,
                }
            },

            Action::UpdateCartItem {
                product_id,
                variant_id,
                quantity,
            } => match self.hold(session_id, *product_id, *variant_id, *quantity, soft_cart_ttl).await {
                HoldResult::Held => match self.upsert_cart_line(session_id, *product_id, *variant_id, *quantity).await {
                    Ok(mut snapshot) => {
                        snapshot.version = cart_before.version + 1;
                        ActionOutcome {
                            assistant_text: "Updated your cart.".to_string(),
                            attached_products: Vec::new(),
                            cart_snapshot: Some(snapshot),
                            error: None,
                        }
                    },
                    Err(outcome) => outcome,
                },
                HoldResult::Insufficient { requested, available } => ActionOutcome::error(
                    format!("Only {available} of that item are available right now."),
                    ActionError {
                        code: ErrorCode::StockInsufficient,
                        message: format!("requested {requested}, available {available}"),
                    },
                ),
            },

            Action::RemoveFromCart { product_id, variant_id } => {
                self.release_line(session_id, *product_id, *variant_id).await;
                match self.remove_cart_line(session_id, *product_id, *variant_id).await {
                    Ok(mut snapshot) => {
                        snapshot.version = cart_before.version + 1;
                        ActionOutcome {
                            assistant_text: "Removed from your cart.".to_string(),
                            attached_products: Vec::new(),
                            cart_snapshot: Some(snapshot),
                            error: None,
                        }
                    },
                    Err(outcome) => outcome,
                }
            },

            Action::StartCheckout { .. } => {
                let mut sorted_lines = cart_before.lines.clone();
                sorted_lines.sort_by_key(|line| (line.product_id, line.variant_id));

                for line in &sorted_lines {
                    if let HoldResult::Insufficient { requested, available } = self
                        .hold(session_id, line.product_id, line.variant_id, line.quantity, checkout_ttl)
                        .await
                    {
                        return ActionOutcome::error(
                            "One of your items is no longer available in that quantity.",
                            ActionError {
                                code: ErrorCode::StockInsufficient,
                                message: format!("requested {requested}, available {available}"),
                            },
                        );
                    }
                }

                ActionOutcome::text("Your order is ready. Confirm with a payment method to finish up.")
            },

            Action::ConfirmOrder { payment_token } => {
                let Some(checkout) = pending_checkout else {
                    return ActionOutcome::error(
                        "There's no checkout in progress to confirm.",
                        ActionError {
                            code: ErrorCode::Internal,
                            message: "ConfirmOrder with no pending checkout".to_string(),
                        },
                    );
                };
                match self
                    .order
                    .create(
                        session_id.as_str(),
                        cart_before,
                        &checkout.shipping_address,
                        &checkout.billing_address,
                        payment_token,
                    )
                    .await
                {
                    Ok(order_id) => {
                        let mut sorted_lines = cart_before.lines.clone();
                        sorted_lines.sort_by_key(|line| (line.product_id, line.variant_id));
                        for line in &sorted_lines {
                            if let Err(outcome) = self.consume_line(session_id, line, checkout_ttl).await {
                                return outcome;
                            }
                        }
                        ActionOutcome::text(format!("Order {order_id} confirmed. Thank you!"))
                    },
                    Err(PortError::Rejected(reason)) => ActionOutcome::error(
                        "Your payment could not be processed.",
                        ActionError {
                            code: ErrorCode::PaymentFailed,
                            message: reason,
                        },
                    ),
                    Err(error) => port_error_outcome("I couldn't finish placing your order.", &error),
                }
            },

            Action::Cancel => {
                let mut sorted_lines = cart_before.lines.clone();
                sorted_lines.sort_by_key(|line| (line.product_id, line.variant_id));
                for line in &sorted_lines {
                    self.release_line(session_id, line.product_id, line.variant_id).await;
                }
                ActionOutcome::text("Checkout cancelled; your cart is still saved.")
            },
        }
    }
}

fn port_error_outcome(assistant_text: &str, error: &PortError) -> ActionOutcome {
    ActionOutcome::error(
        assistant_text.to_string(),
        ActionError {
            code: ErrorCode::Internal,
            message: error.to_string(),
        },
    )
}

/// Maps a cart-port error into an outcome, taking `PortError::Rejected` (an
/// optimistic-concurrency loss on the upsert/remove retry) as `CART_CONFLICT`
/// rather than falling through to `Internal`.
fn cart_conflict_or_port_error(error: PortError) -> ActionOutcome {
    match error {
        PortError::Rejected(reason) => ActionOutcome::error(
            "Someone else updated your cart at the same time. Please try again.",
            ActionError {
                code: ErrorCode::CartConflict,
                message: reason,
            },
        ),
        other => port_error_outcome("I couldn't update your cart.", &other),
    }
}

/// Builds the outcome for a reservation that lapsed and could not be
/// recovered by a single re-reserve-and-retry.
fn reservation_expired_outcome() -> ActionOutcome {
    ActionOutcome::error(
        "One of your reservations expired before checkout finished. Please try again.",
        ActionError {
            code: ErrorCode::ReservationExpired,
            message: "reservation lapsed and could not be renewed before consume".to_string(),
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ports::ProductSummary;
    use composable_rust_core::environment::SystemClock;
    use composable_rust_testing::mocks::{InMemoryEventBus, InMemoryEventStore};
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    struct StubCatalog;
    impl ProductCatalog for StubCatalog {
        fn search(&self, _query: &str, _filters: &BTreeMap<String, String>, _limit: usize) -> BoxFuture<'_, Result<Vec<ProductSummary>, PortError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn get_many(&self, _ids: &[ProductId]) -> BoxFuture<'_, Result<Vec<ProductSummary>, PortError>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct StubCart {
        snapshot: Mutex<CartSnapshot>,
    }
    impl Cart for StubCart {
        fn get(&self, _session_id: &str) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            Box::pin(async move { Ok(snapshot) })
        }
        fn upsert(
            &self,
            _session_id: &str,
            product_id: ProductId,
            variant_id: Option<VariantId>,
            quantity: u32,
        ) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            snapshot.lines.retain(|l| !l.matches(product_id, variant_id));
            snapshot.lines.push(crate::types::CartLine {
                product_id,
                variant_id,
                quantity,
                unit_price: 100,
                line_total: 100 * u64::from(quantity),
            });
            snapshot.reprice();
            let result = snapshot.clone();
            Box::pin(async move { Ok(result) })
        }
        fn remove(
            &self,
            _session_id: &str,
            product_id: ProductId,
            variant_id: Option<VariantId>,
        ) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            snapshot.lines.retain(|l| !l.matches(product_id, variant_id));
            snapshot.reprice();
            let result = snapshot.clone();
            Box::pin(async move { Ok(result) })
        }
    }

    struct StubOrder {
        reject: bool,
    }
    impl Order for StubOrder {
        fn create(
            &self,
            _session_id: &str,
            _cart: &CartSnapshot,
            _shipping_address: &str,
            _billing_address: &str,
            _payment_token: &str,
        ) -> BoxFuture<'_, Result<crate::types::OrderId, PortError>> {
            let reject = self.reject;
            Box::pin(async move {
                if reject {
                    Err(PortError::Rejected("card declined".to_string()))
                } else {
                    Ok(crate::types::OrderId::new())
                }
            })
        }
    }

    fn executor(reject_order: bool) -> ActionExecutor {
        ActionExecutor::new(
            Arc::new(StubCatalog),
            Arc::new(StubCart {
                snapshot: Mutex::new(CartSnapshot::empty("USD")),
            }),
            Arc::new(StubOrder { reject: reject_order }),
            Arc::new(SystemClock),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        )
    }

    #[tokio::test]
    async fn add_to_cart_holds_stock_and_updates_the_cart() {
        let executor = executor(false);
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 5,
            })
            .await;

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::AddToCart {
                    product_id,
                    variant_id: None,
                    quantity: 2,
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert!(outcome.error.is_none());
        assert!(outcome.cart_snapshot.is_some());
    }

    #[tokio::test]
    async fn add_to_cart_reports_insufficient_stock() {
        let executor = executor(false);
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 1,
            })
            .await;

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::AddToCart {
                    product_id,
                    variant_id: None,
                    quantity: 5,
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::StockInsufficient));
    }

    #[tokio::test]
    async fn confirm_order_without_pending_checkout_is_rejected() {
        let executor = executor(false);
        let session_id = SessionId::generate();

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::ConfirmOrder {
                    payment_token: "tok_1".to_string(),
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::Internal));
    }

    #[tokio::test]
    async fn confirm_order_maps_payment_rejection() {
        let executor = executor(true);
        let session_id = SessionId::generate();
        let checkout = PendingCheckout {
            contact: "a@b.com".to_string(),
            shipping_address: "1 Main St".to_string(),
            billing_address: "1 Main St".to_string(),
        };

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                Some(&checkout),
                &Action::ConfirmOrder {
                    payment_token: "tok_1".to_string(),
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::PaymentFailed));
    }

    #[tokio::test]
    async fn add_to_cart_bumps_the_cart_version() {
        let executor = executor(false);
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 5,
            })
            .await;

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::AddToCart {
                    product_id,
                    variant_id: None,
                    quantity: 2,
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.cart_snapshot.map(|s| s.version), Some(1));
    }

    struct FlakyCart {
        snapshot: Mutex<CartSnapshot>,
        remaining_failures: Mutex<u32>,
    }
    impl Cart for FlakyCart {
        fn get(&self, _session_id: &str) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
            Box::pin(async move { Ok(snapshot) })
        }
        fn upsert(
            &self,
            _session_id: &str,
            product_id: ProductId,
            variant_id: Option<VariantId>,
            quantity: u32,
        ) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let mut remaining = self.remaining_failures.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if *remaining > 0 {
                *remaining -= 1;
                return Box::pin(async { Err(PortError::Rejected("optimistic lock lost".to_string())) });
            }
            drop(remaining);
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            snapshot.lines.retain(|l| !l.matches(product_id, variant_id));
            snapshot.lines.push(CartLine {
                product_id,
                variant_id,
                quantity,
                unit_price: 100,
                line_total: 100 * u64::from(quantity),
            });
            snapshot.reprice();
            let result = snapshot.clone();
            Box::pin(async move { Ok(result) })
        }
        fn remove(
            &self,
            _session_id: &str,
            product_id: ProductId,
            variant_id: Option<VariantId>,
        ) -> BoxFuture<'_, Result<CartSnapshot, PortError>> {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            snapshot.lines.retain(|l| !l.matches(product_id, variant_id));
            snapshot.reprice();
            let result = snapshot.clone();
            Box::pin(async move { Ok(result) })
        }
    }

    #[tokio::test]
    async fn a_lost_cart_upsert_race_is_retried_once_and_succeeds() {
        let executor = ActionExecutor::new(
            Arc::new(StubCatalog),
            Arc::new(FlakyCart {
                snapshot: Mutex::new(CartSnapshot::empty("USD")),
                remaining_failures: Mutex::new(1),
            }),
            Arc::new(StubOrder { reject: false }),
            Arc::new(SystemClock),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        );
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 5,
            })
            .await;

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::AddToCart {
                    product_id,
                    variant_id: None,
                    quantity: 2,
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert!(outcome.error.is_none());
        assert!(outcome.cart_snapshot.is_some());
    }

    #[tokio::test]
    async fn a_persistently_lost_race_surfaces_cart_conflict() {
        let executor = ActionExecutor::new(
            Arc::new(StubCatalog),
            Arc::new(FlakyCart {
                snapshot: Mutex::new(CartSnapshot::empty("USD")),
                remaining_failures: Mutex::new(2),
            }),
            Arc::new(StubOrder { reject: false }),
            Arc::new(SystemClock),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        );
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 5,
            })
            .await;

        let outcome = executor
            .apply(
                &session_id,
                &CartSnapshot::empty("USD"),
                None,
                &Action::AddToCart {
                    product_id,
                    variant_id: None,
                    quantity: 1,
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::CartConflict));
    }

    #[tokio::test]
    async fn confirm_order_rereserves_after_a_lapsed_reservation_and_succeeds() {
        let executor = executor(false);
        let session_id = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 5,
            })
            .await;

        match executor.hold(&session_id, product_id, None, 2, Duration::from_secs(1)).await {
            HoldResult::Held => {},
            HoldResult::Insufficient { .. } => panic!("expected stock to be available"),
        }

        // Sweep the line far enough forward that the short-TTL reservation
        // above has lapsed.
        line_store
            .send(ReservationAction::ReapExpired {
                now: chrono::Utc::now() + chrono::Duration::seconds(60),
            })
            .await;

        let cart = CartSnapshot {
            lines: vec![CartLine {
                product_id,
                variant_id: None,
                quantity: 2,
                unit_price: 100,
                line_total: 200,
            }],
            ..CartSnapshot::empty("USD")
        };
        let checkout = PendingCheckout {
            contact: "a@b.com".to_string(),
            shipping_address: "1 Main St".to_string(),
            billing_address: "1 Main St".to_string(),
        };

        let outcome = executor
            .apply(
                &session_id,
                &cart,
                Some(&checkout),
                &Action::ConfirmOrder {
                    payment_token: "tok_1".to_string(),
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert!(outcome.error.is_none(), "expected re-reserve-and-retry to succeed: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn confirm_order_reports_reservation_expired_when_stock_is_gone() {
        let executor = executor(false);
        let session_id = SessionId::generate();
        let other_session = SessionId::generate();
        let product_id = ProductId::new();
        let line_store = executor.line_store(product_id, None).await;
        line_store
            .send(ReservationAction::SeedStock {
                product_id,
                variant_id: None,
                on_hand: 2,
            })
            .await;

        match executor.hold(&session_id, product_id, None, 2, Duration::from_secs(1)).await {
            HoldResult::Held => {},
            HoldResult::Insufficient { .. } => panic!("expected stock to be available"),
        }

        line_store
            .send(ReservationAction::ReapExpired {
                now: chrono::Utc::now() + chrono::Duration::seconds(60),
            })
            .await;

        // Another session grabs the now-free stock before the retry.
        match executor.hold(&other_session, product_id, None, 2, Duration::from_secs(600)).await {
            HoldResult::Held => {},
            HoldResult::Insufficient { .. } => panic!("expected the other session to win the remaining stock"),
        }

        let cart = CartSnapshot {
            lines: vec![CartLine {
                product_id,
                variant_id: None,
                quantity: 2,
                unit_price: 100,
                line_total: 200,
            }],
            ..CartSnapshot::empty("USD")
        };
        let checkout = PendingCheckout {
            contact: "a@b.com".to_string(),
            shipping_address: "1 Main St".to_string(),
            billing_address: "1 Main St".to_string(),
        };

        let outcome = executor
            .apply(
                &session_id,
                &cart,
                Some(&checkout),
                &Action::ConfirmOrder {
                    payment_token: "tok_1".to_string(),
                },
                Duration::from_secs(600),
                Duration::from_secs(900),
            )
            .await;

        assert_eq!(outcome.error.map(|e| e.code), Some(ErrorCode::StockInsufficient));
    }
}
