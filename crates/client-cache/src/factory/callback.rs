//! Fan-out of client lifecycle events to registered reconciler callbacks.
//!
//! Each handler carries an event mask; dispatch spawns one task per
//! matching handler so a slow reconciler never blocks the factory's
//! lifecycle channel. There is no ordering guarantee across handlers —
//! each one individually sees events in the order the factory produced
//! them.

use crate::client::{ClientEvent, LifecycleEvent, VaultClient};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// The callable half of a handler
pub type ClientCallbackFn = Arc<dyn Fn(Arc<VaultClient>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered lifecycle callback
#[derive(Clone)]
pub struct ClientCallbackHandler {
    /// Events the handler wants
    pub on: ClientEvent,
    /// The callback itself
    pub callback: ClientCallbackFn,
}

impl ClientCallbackHandler {
    /// Wrap an async closure as a handler for the masked events
    pub fn new<F, Fut>(on: ClientEvent, callback: F) -> Self
    where
        F: Fn(Arc<VaultClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            on,
            callback: Arc::new(move |client| Box::pin(callback(client))),
        }
    }
}

impl std::fmt::Debug for ClientCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCallbackHandler")
            .field("on", &self.on)
            .finish()
    }
}

/// The set of registered handlers
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<Vec<ClientCallbackHandler>>,
}

impl CallbackRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn register(&self, handler: ClientCallbackHandler) {
        self.handlers.write().push(handler);
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether any handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Fan the event out to every handler whose mask matches, one task
    /// per invocation
    pub fn dispatch(&self, event: &LifecycleEvent) {
        let handlers: Vec<ClientCallbackHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.on.intersects(event.on))
            .cloned()
            .collect();
        if handlers.is_empty() {
            return;
        }
        debug!(
            client_id = %event.client.id(),
            handlers = handlers.len(),
            "dispatching lifecycle event"
        );
        for handler in handlers {
            let client = Arc::clone(&event.client);
            let _ = tokio::spawn(async move { (handler.callback)(client).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_respects_masks() {
        let ctx = TestContext::new();
        let client = testing::initialized_client(&ctx, 0).await;
        let registry = CallbackRegistry::new();

        let watcher_hits = Arc::new(AtomicUsize::new(0));
        let removal_hits = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&watcher_hits);
        registry.register(ClientCallbackHandler::new(
            ClientEvent::WATCHER_DONE,
            move |_| {
                let w = Arc::clone(&w);
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));
        let r = Arc::clone(&removal_hits);
        registry.register(ClientCallbackHandler::new(
            ClientEvent::WATCHER_DONE | ClientEvent::CACHE_REMOVAL,
            move |_| {
                let r = Arc::clone(&r);
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        registry.dispatch(&LifecycleEvent::new(
            ClientEvent::CACHE_REMOVAL,
            Arc::clone(&client),
        ));
        registry.dispatch(&LifecycleEvent::new(ClientEvent::WATCHER_DONE, client));

        // Handlers run on spawned tasks; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(watcher_hits.load(Ordering::SeqCst), 1);
        assert_eq!(removal_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let ctx = TestContext::new();
        let client = testing::initialized_client(&ctx, 0).await;
        let registry = CallbackRegistry::new();
        assert!(registry.is_empty());
        registry.dispatch(&LifecycleEvent::new(ClientEvent::WATCHER_DONE, client));
    }
}
