//! Application state shared across request handlers.

use std::sync::Arc;

use crate::coordinators::CoordinatorRegistry;
use crate::proxy::Proxy;
use crate::registry::Registry;
use crate::store::KvStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Registry,
    coordinators: CoordinatorRegistry,
    proxy: Proxy,
    store: Arc<dyn KvStore>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        registry: Registry,
        coordinators: CoordinatorRegistry,
        proxy: Proxy,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                coordinators,
                proxy,
                store,
            }),
        }
    }

    /// Get a reference to the worker registry.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Get a reference to the regional coordinator registry.
    pub fn coordinators(&self) -> &CoordinatorRegistry {
        &self.inner.coordinators
    }

    /// Get a reference to the request proxy.
    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    /// Get a reference to the backing store.
    pub fn store(&self) -> &dyn KvStore {
        self.inner.store.as_ref()
    }
}

#[cfg(test)]
impl AppState {
    /// State over an in-memory store with default windows. The coordinator
    /// actor's shutdown sender is leaked so the actor outlives the test.
    pub async fn for_tests(store: Arc<crate::store::MemoryStore>) -> Self {
        use crate::config::Windows;
        use crate::proxy::DEFAULT_PROXY_TIMEOUT;
        use crate::registry::RegistryConfig;
        use tokio::sync::watch;

        let store: Arc<dyn KvStore> = store;
        let windows = Windows::default();

        let registry = Registry::load(
            store.clone(),
            RegistryConfig {
                staleness: windows.staleness,
                persist_throttle: windows.persist_throttle,
                heartbeat_interval: windows.heartbeat_interval,
            },
        )
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        std::mem::forget(shutdown_tx);
        let (coordinators, _handle) =
            CoordinatorRegistry::spawn(store.clone(), windows.coordinator_activity, shutdown_rx)
                .await
                .unwrap();

        let proxy = Proxy::new(DEFAULT_PROXY_TIMEOUT).unwrap();

        Self::new(registry, coordinators, proxy, store)
    }
}
