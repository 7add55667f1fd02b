//! Get-or-create registry for per-instance aggregate [`Store`]s.
//!
//! Both the Session Store (C2) and the Reservation Ledger (C1) shard by
//! instance — one stream and one `Store` per session, one per stock line.
//! This is the single piece of machinery both shards need: a short-lived map
//! lock to find or create the right `Store`, after which every `send()`
//! against that `Store` already serializes at the reducer level, which is
//! what actually gives each session/line a single writer.

use composable_rust_core::reducer::Reducer;
use composable_rust_runtime::Store;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A registry of lazily-created, per-key `Store` instances.
pub struct AggregateRegistry<K, S, A, E, R>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    stores: RwLock<HashMap<K, Arc<Store<S, A, E, R>>>>,
}

impl<K, S, A, E, R> AggregateRegistry<K, S, A, E, R>
where
    K: Eq + Hash + Clone,
    R: Reducer<State = S, Action = A, Environment = E> + Clone + Default + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the `Store` for `key`, creating it (with a fresh default
    /// state and reducer, and the environment `build_env` produces) if this
    /// is the first time `key` has been seen.
    ///
    /// Acquires the map's write lock only on the creation path; an existing
    /// instance is found and cloned out under a read lock.
    pub async fn get_or_create(&self, key: K, build_env: impl FnOnce(&K) -> E) -> Arc<Store<S, A, E, R>> {
        if let Some(store) = self.stores.read().await.get(&key) {
            return Arc::clone(store);
        }
        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(&key) {
            return Arc::clone(store);
        }
        let environment = build_env(&key);
        let store = Arc::new(Store::new(S::default(), R::default(), environment));
        stores.insert(key.clone(), Arc::clone(&store));
        store
    }

    /// Snapshot of the keys currently instantiated; used by sweepers that
    /// need to visit every live instance.
    pub async fn keys(&self) -> Vec<K> {
        self.stores.read().await.keys().cloned().collect()
    }

    /// Unconditionally replaces whatever `Store` is registered for `key`
    /// with a freshly constructed one (fresh default state, fresh
    /// environment from `build_env`). Used when an aggregate instance must
    /// start over rather than be found or lazily created, e.g. a terminal
    /// session resuming under the same id.
    pub async fn replace(&self, key: K, build_env: impl FnOnce(&K) -> E) -> Arc<Store<S, A, E, R>> {
        let environment = build_env(&key);
        let store = Arc::new(Store::new(S::default(), R::default(), environment));
        let mut stores = self.stores.write().await;
        stores.insert(key, Arc::clone(&store));
        store
    }
}

impl<K, S, A, E, R> Default for AggregateRegistry<K, S, A, E, R>
where
    K: Eq + Hash + Clone,
    R: Reducer<State = S, Action = A, Environment = E> + Clone + Default + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
    A: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregates::reservation::{ReservationAction, ReservationEnvironment, ReservationLineState, ReservationReducer};
    use composable_rust_core::environment::SystemClock;
    use composable_rust_core::stream::StreamId;
    use composable_rust_testing::mocks::{InMemoryEventBus, InMemoryEventStore};

    type LineRegistry = AggregateRegistry<(u128, Option<u128>), ReservationLineState, ReservationAction, ReservationEnvironment, ReservationReducer>;

    #[tokio::test]
    async fn repeated_lookups_return_the_same_instance() {
        let registry = LineRegistry::new();
        let key = (1, None);

        let first = registry
            .get_or_create(key, |_| {
                ReservationEnvironment::new(
                    Arc::new(SystemClock),
                    Arc::new(InMemoryEventStore::new()),
                    Arc::new(InMemoryEventBus::new()),
                    StreamId::new("reservation-line-registry-test"),
                )
            })
            .await;
        let second = registry
            .get_or_create(key, |_| {
                panic!("build_env must not run on a cache hit")
            })
            .await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.keys().await.len(), 1);
    }
}
