//! NLU Adapter (C4).
//!
//! Turns free-form user text into one validated [`Action`], or a stable
//! error. The adapter is the only place in this crate allowed to call an
//! external language model; everything downstream only ever sees a decoded,
//! schema- and semantically-validated `Action` — the same shape the model
//! itself would have had to produce even if every caller upstream were
//! trusted, per the boundary [`crate::catalog`] documents.
//!
//! Reliability is delegated to [`composable_rust_runtime::CircuitBreaker`]
//! rather than hand-rolled: a run of model failures opens the circuit and
//! every subsequent turn fails fast with [`NluError::ModelUnavailable`]
//! instead of queuing behind a slow or dead backend.

use crate::catalog::{Action, ActionValidationError};
use crate::ports::{LanguageModel, PortError};
use crate::types::{CartSnapshot, TurnRecord, TurnRole};
use composable_rust_runtime::{CircuitBreaker, CircuitBreakerError, Either};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors the NLU Adapter can surface; both map to a user-visible
/// [`crate::types::ErrorCode`] one-to-one in the Dialogue Controller.
#[derive(Debug, Error)]
pub enum NluError {
    /// The model could not be reached, deadlined, or the circuit is open.
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),
    /// The model responded, but no repair attempt produced a valid action.
    #[error("could not decode a valid action: {0}")]
    Undecodable(String),
}

/// Composes the prompt handed to the language model from a bounded history
/// window, the current cart, and the new user turn.
#[must_use]
pub fn compose_prompt(history: &[TurnRecord], history_window: usize, cart: &CartSnapshot, user_text: &str) -> String {
    let mut prompt = String::from(
        "You are the natural-language front end of a shopping assistant. \
         Decode the user's final message into exactly one structured action \
         from the provided schema. Respond with that action and nothing else.\n\n",
    );

    prompt.push_str(&format!(
        "Current cart: {} line(s), total {} {}\n\n",
        cart.lines.len(),
        cart.total,
        cart.currency
    ));

    prompt.push_str("Conversation so far:\n");
    let start = history.len().saturating_sub(history_window);
    for turn in &history[start..] {
        let speaker = match turn.role {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
            TurnRole::System => "System",
        };
        prompt.push_str(&format!("{speaker}: {}\n", turn.text));
    }

    prompt.push_str(&format!("User: {user_text}\n"));
    prompt
}

/// Adapter around a [`LanguageModel`] port, enforcing a deadline and a
/// circuit breaker, and validating every decoded action before handing it
/// back.
pub struct NluAdapter {
    model: Arc<dyn LanguageModel>,
    breaker: CircuitBreaker,
}

impl NluAdapter {
    /// Creates a new adapter wired to `model`, opening its circuit after
    /// `failure_threshold` consecutive failures for `circuit_timeout`.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, failure_threshold: usize, circuit_timeout: Duration) -> Self {
        let breaker = CircuitBreaker::new()
            .with_failure_threshold(failure_threshold)
            .with_timeout(circuit_timeout);
        Self { model, breaker }
    }

    /// Decodes one user turn into a validated [`Action`].
    ///
    /// Makes at most two model calls: the initial attempt, and — only if
    /// that response fails to parse or validate — one repair attempt that
    /// includes the failure reason in the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`NluError::ModelUnavailable`] if the circuit is open or the
    /// model call fails/deadlines. Returns [`NluError::Undecodable`] if
    /// neither attempt produces a schema- and semantically-valid action.
    #[tracing::instrument(skip(self, history, cart))]
    pub async fn decode(
        &self,
        history: &[TurnRecord],
        history_window: usize,
        cart: &CartSnapshot,
        user_text: &str,
        deadline: Duration,
    ) -> Result<Action, NluError> {
        let prompt = compose_prompt(history, history_window, cart, user_text);
        let schema = Action::json_schema();

        let first = self.call_model(&prompt, &schema, deadline).await?;
        match Self::parse_and_validate(&first) {
            Ok(action) => Ok(action),
            Err(reason) => {
                metrics::counter!("engine.nlu.repair_attempts.total").increment(1);
                let repair_prompt = format!(
                    "{prompt}\n\nYour previous response was rejected: {reason}. \
                     Respond again with a single valid action matching the schema exactly."
                );
                let second = self.call_model(&repair_prompt, &schema, deadline).await?;
                Self::parse_and_validate(&second).map_err(NluError::Undecodable)
            },
        }
    }

    async fn call_model(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        deadline: Duration,
    ) -> Result<serde_json::Value, NluError> {
        let start = std::time::Instant::now();
        let result = self
            .breaker
            .call(|| self.model.complete(prompt, schema, deadline))
            .await;
        metrics::histogram!("engine.nlu.decode.duration_seconds").record(start.elapsed().as_secs_f64());
        metrics::gauge!("engine.nlu.circuit_state").set(circuit_state_gauge(self.breaker.state()));

        match result {
            Ok(value) => Ok(value),
            Err(Either::Left(CircuitBreakerError::Open)) => {
                Err(NluError::ModelUnavailable("circuit open".to_string()))
            },
            Err(Either::Right(PortError::Timeout)) => Err(NluError::ModelUnavailable("model call timed out".to_string())),
            Err(Either::Right(error)) => Err(NluError::ModelUnavailable(error.to_string())),
        }
    }

    fn parse_and_validate(value: &serde_json::Value) -> Result<Action, String> {
        let action: Action = serde_json::from_value(value.clone()).map_err(|error| error.to_string())?;
        action
            .validate()
            .map_err(|error: ActionValidationError| error.to_string())?;
        Ok(action)
    }
}

const fn circuit_state_gauge(state: composable_rust_runtime::CircuitState) -> f64 {
    match state {
        composable_rust_runtime::CircuitState::Closed => 0.0,
        composable_rust_runtime::CircuitState::HalfOpen => 1.0,
        composable_rust_runtime::CircuitState::Open => 2.0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        responses: Vec<Result<serde_json::Value, PortError>>,
        calls: AtomicUsize,
    }

    impl LanguageModel for ScriptedModel {
        fn complete(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _deadline: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, PortError>> + Send + '_>> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .get(index)
                .cloned()
                .unwrap_or_else(|| Err(PortError::Other("no more scripted responses".to_string())));
            Box::pin(async move { response })
        }
    }

    fn adapter(responses: Vec<Result<serde_json::Value, PortError>>) -> NluAdapter {
        let model = Arc::new(ScriptedModel {
            responses,
            calls: AtomicUsize::new(0),
        });
        NluAdapter::new(model, 5, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn decodes_a_well_formed_response_on_the_first_try() {
        let adapter = adapter(vec![Ok(serde_json::json!({ "action": "greet" }))]);
        let action = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "hi", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(action, Action::Greet);
    }

    #[tokio::test]
    async fn repairs_an_invalid_response_once() {
        let adapter = adapter(vec![
            Ok(serde_json::json!({ "action": "add_to_cart", "product_id": "not-a-uuid", "quantity": 1 })),
            Ok(serde_json::json!({ "action": "greet" })),
        ]);
        let action = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "add that", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(action, Action::Greet);
    }

    #[tokio::test]
    async fn gives_up_as_undecodable_after_one_failed_repair() {
        let adapter = adapter(vec![
            Ok(serde_json::json!({ "not_an_action": true })),
            Ok(serde_json::json!({ "still_not_an_action": true })),
        ]);
        let error = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "???", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, NluError::Undecodable(_)));
    }

    #[tokio::test]
    async fn port_failure_maps_to_model_unavailable() {
        let adapter = adapter(vec![Err(PortError::Timeout)]);
        let error = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "hi", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, NluError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling_the_model() {
        let model = Arc::new(ScriptedModel {
            responses: vec![Err(PortError::Other("boom".to_string())); 10],
            calls: AtomicUsize::new(0),
        });
        let adapter = NluAdapter::new(model, 1, Duration::from_secs(60));

        let _ = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "hi", Duration::from_secs(5))
            .await;
        // One decode can issue up to two model calls (initial + repair); both
        // fail, so after this the breaker must be open.
        let error = adapter
            .decode(&[], 16, &CartSnapshot::empty("USD"), "hi again", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(error, NluError::ModelUnavailable(_)));
    }
}
