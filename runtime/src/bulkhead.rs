//! Bulkhead pattern for resource isolation.
//!
//! Named after ship bulkheads that stop water from flooding the whole hull:
//! a [`Bulkhead`] limits how many concurrent callers can be inside a guarded
//! section at once, so a slow or overloaded dependency (e.g. the NL decode
//! service) can't starve unrelated work of threads/connections.
//!
//! Complements [`crate::CircuitBreaker`]: the circuit breaker trips on
//! *failures*, the bulkhead trips on *concurrency*. A call site typically
//! wraps a circuit breaker call inside a bulkhead's permit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
    /// How long to wait for a permit before giving up.
    pub acquire_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Error returned when a bulkhead cannot grant a permit.
#[derive(Debug, thiserror::Error)]
pub enum BulkheadError {
    /// No permit became available within `acquire_timeout`.
    #[error("bulkhead '{name}' acquire timeout after {timeout:?}")]
    AcquireTimeout {
        /// Name of the bulkhead.
        name: String,
        /// The configured timeout.
        timeout: Duration,
    },
}

/// Limits concurrent access to a guarded resource via a semaphore.
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    config: BulkheadConfig,
}

impl Bulkhead {
    /// Create a new bulkhead.
    ///
    /// `name` identifies the guarded resource in logs and metrics
    /// (e.g. `"nlu_decode"`).
    #[must_use]
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
        }
    }

    /// Run `f` while holding a permit, waiting up to `acquire_timeout` to get one.
    ///
    /// # Errors
    ///
    /// Returns [`BulkheadError::AcquireTimeout`] if no permit is available in time.
    pub async fn execute<F, T>(&self, f: F) -> Result<T, BulkheadError>
    where
        F: std::future::Future<Output = T>,
    {
        let permit = tokio::time::timeout(self.config.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                tracing::warn!(bulkhead = %self.name, timeout = ?self.config.acquire_timeout, "acquire timeout");
                BulkheadError::AcquireTimeout {
                    name: self.name.clone(),
                    timeout: self.config.acquire_timeout,
                }
            })?
            .expect("bulkhead semaphore is never closed");

        tracing::trace!(bulkhead = %self.name, "permit acquired");
        metrics::gauge!("bulkhead.in_flight", "name" => self.name.clone())
            .increment(1.0);

        let result = f.await;

        metrics::gauge!("bulkhead.in_flight", "name" => self.name.clone())
            .decrement(1.0);
        drop(permit);

        Ok(result)
    }

    /// Permits currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Name this bulkhead was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured concurrency ceiling.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }
}

/// A named collection of [`Bulkhead`]s, one per guarded resource.
#[derive(Default)]
pub struct BulkheadRegistry {
    bulkheads: HashMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bulkhead under `name`.
    pub fn register(&mut self, name: impl Into<String>, bulkhead: Bulkhead) {
        self.bulkheads.insert(name.into(), Arc::new(bulkhead));
    }

    /// Look up a bulkhead by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).cloned()
    }

    /// Names of every registered bulkhead.
    #[must_use]
    pub fn names(&self) -> Vec<&String> {
        self.bulkheads.keys().collect()
    }

    /// Number of registered bulkheads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    /// Whether the registry holds no bulkheads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn limits_concurrent_operations() {
        let config = BulkheadConfig {
            max_concurrent: 2,
            acquire_timeout: Duration::from_secs(5),
        };
        let bulkhead = Arc::new(Bulkhead::new("test", config));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..5 {
            let bulkhead = Arc::clone(&bulkhead);
            let max_seen = Arc::clone(&max_seen);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute(async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn times_out_when_saturated() {
        let config = BulkheadConfig {
            max_concurrent: 1,
            acquire_timeout: Duration::from_millis(50),
        };
        let bulkhead = Arc::new(Bulkhead::new("test", config));

        let held = Arc::clone(&bulkhead);
        let handle = tokio::spawn(async move {
            held.execute(async { tokio::time::sleep(Duration::from_secs(1)).await })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = bulkhead.execute(async { "unreachable" }).await;
        assert!(matches!(result, Err(BulkheadError::AcquireTimeout { .. })));

        handle.abort();
    }

    #[test]
    fn registry_tracks_bulkheads_by_name() {
        let mut registry = BulkheadRegistry::new();
        assert!(registry.is_empty());

        registry.register("nlu", Bulkhead::new("nlu", BulkheadConfig::default()));
        registry.register("catalog", Bulkhead::new("catalog", BulkheadConfig::default()));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("nlu").unwrap().name(), "nlu");
        assert!(registry.get("missing").is_none());
    }
}
