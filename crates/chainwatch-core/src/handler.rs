//! Event handler trait + registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::WatchError;
use crate::types::{ChainEvent, EventKind, WatchContext};

/// Trait for user-provided event handlers.
///
/// A handler is expected to be idempotent: the same event may be dispatched
/// twice when live and backfill delivery overlap. The standard shape is
/// create-if-absent on the record store with side effects gated by the
/// newly-created flag (see [`crate::deals`]).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for each decoded event whose kind matches [`Self::kind`].
    async fn handle(&self, event: &ChainEvent, ctx: &WatchContext) -> Result<(), WatchError>;

    /// The event variant this handler processes.
    fn kind(&self) -> EventKind;
}

/// Registry of event handlers, keyed by event variant.
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for its declared event variant.
    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(handler.kind())
            .or_default()
            .push(handler);
    }

    /// Dispatch an event to all matching handlers, sequentially and
    /// fail-fast. A variant with no registered handler is a no-op.
    pub async fn dispatch(
        &self,
        event: &ChainEvent,
        ctx: &WatchContext,
    ) -> Result<(), WatchError> {
        if let Some(handlers) = self.handlers.get(&event.payload.kind()) {
            for handler in handlers {
                handler.handle(event, ctx).await?;
            }
        }
        Ok(())
    }

    /// Number of registered handlers across all variants.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventPayload, Network, WatchPhase};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>, EventKind);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _e: &ChainEvent, _c: &WatchContext) -> Result<(), WatchError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn kind(&self) -> EventKind {
            self.1
        }
    }

    fn ctx() -> WatchContext {
        WatchContext {
            network: Network::from("testnet"),
            phase: WatchPhase::Backfill,
        }
    }

    fn event(payload: EventPayload) -> ChainEvent {
        ChainEvent {
            tx_hash: "0x1".into(),
            block_position: 1,
            payload,
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_variant() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.on_event(Arc::new(Counter(count.clone(), EventKind::DealRegistered)));

        let ctx = ctx();
        registry
            .dispatch(&event(EventPayload::DealRegistered { nonce: "1".into() }), &ctx)
            .await
            .unwrap();
        registry
            .dispatch(&event(EventPayload::DealClosed { nonce: "1".into() }), &ctx)
            .await
            .unwrap(); // no handler registered

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn dispatch_is_fail_fast() {
        struct Failing;
        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(&self, e: &ChainEvent, _c: &WatchContext) -> Result<(), WatchError> {
                Err(WatchError::Handler {
                    kind: e.payload.kind().to_string(),
                    position: e.block_position,
                    reason: "boom".into(),
                })
            }
            fn kind(&self) -> EventKind {
                EventKind::DealActivated
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.on_event(Arc::new(Failing));
        registry.on_event(Arc::new(Counter(count.clone(), EventKind::DealActivated)));

        let err = registry
            .dispatch(&event(EventPayload::DealActivated { nonce: "1".into() }), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Handler { .. }));
        // The second handler never ran.
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
