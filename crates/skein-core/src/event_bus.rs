//! Generic named publish/subscribe bus
//!
//! Handlers are registered per event name and all handlers for a name are
//! awaited on `emit`. There is no persistence and no ordering guarantee beyond
//! "every handler registered at emit time sees the event". A failing or
//! panicking handler never prevents the others from running.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;

/// Identifier returned by [`EventBus::on`], used to remove the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type EventHandler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Outcome of a single [`EventBus::emit`]
#[derive(Debug, Default)]
pub struct EmitReport {
    pub delivered: usize,
    pub failures: Vec<String>,
}

impl EmitReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct EventBus<E> {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler<E>)>>>,
    next_id: AtomicU64,
}

impl<E> Default for EventBus<E>
where
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `name`
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandler<E> = Arc::new(move |event| handler(event).boxed());
        self.handlers
            .write()
            .entry(name.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(bucket) = handlers.get_mut(name) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(existing, _)| *existing != id);
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    /// Drop the handlers of one event name, or of every name
    pub fn clear(&self, name: Option<&str>) {
        let mut handlers = self.handlers.write();
        match name {
            Some(name) => {
                handlers.remove(name);
            }
            None => handlers.clear(),
        }
    }

    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers.read().get(name).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler registered for `name` and await them all
    pub async fn emit(&self, name: &str, event: E) -> EmitReport {
        let snapshot: Vec<EventHandler<E>> = match self.handlers.read().get(name) {
            Some(bucket) => bucket.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return EmitReport::default(),
        };

        let runs = snapshot.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                // Constructing the future can panic too, so guard the call itself.
                let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                match fut {
                    Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err("handler panicked".to_string()),
                    },
                    Err(_) => Err("handler panicked".to_string()),
                }
            }
        });

        let mut report = EmitReport::default();
        for outcome in join_all(runs).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failures.push(e),
            }
        }
        report
    }
}
