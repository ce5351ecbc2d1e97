//! Priority-ordered hook registry
//!
//! Handlers are bucketed per [`HookName`] and run strictly in ascending
//! priority; equal priorities keep registration order. Each invocation is
//! isolated, so an erroring or panicking handler is reported and skipped
//! while the remaining handlers still run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;

use super::events::{HookEvent, HookName};

/// A lifecycle hook handler
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Observe or mutate `event`. Errors are reported, never propagated.
    async fn handle(&self, event: &mut HookEvent) -> anyhow::Result<()>;
}

/// Adapter for synchronous closures
pub struct FnHook<F>(F);

impl<F> FnHook<F>
where
    F: Fn(&mut HookEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }

    pub fn shared(f: F) -> Arc<dyn HookHandler> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&mut HookEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &mut HookEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Stable id; re-registering the same id replaces the earlier handler
    pub id: Option<String>,
    pub priority: i32,
}

impl RegisterOptions {
    pub fn priority(priority: i32) -> Self {
        Self { id: None, priority }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HookFailure {
    pub handler_id: String,
    pub message: String,
}

/// Outcome of one [`HookRegistry::emit`]
#[derive(Debug, Default)]
pub struct HookReport {
    pub invoked: usize,
    pub failures: Vec<HookFailure>,
}

impl HookReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Registration {
    id: String,
    priority: i32,
    order: u64,
    handler: Arc<dyn HookHandler>,
}

type Buckets = RwLock<HashMap<HookName, Vec<Registration>>>;

#[derive(Clone, Default)]
pub struct HookRegistry {
    buckets: Arc<Buckets>,
    order: Arc<AtomicU64>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buckets = self.buckets.read();
        let mut dbg = f.debug_struct("HookRegistry");
        for name in HookName::all() {
            dbg.field(name.as_str(), &buckets.get(name).map_or(0, Vec::len));
        }
        dbg.finish()
    }
}

/// Handle returned by [`HookRegistry::register`]
#[derive(Debug, Clone)]
pub struct HookRegistration {
    name: HookName,
    id: String,
    buckets: Weak<Buckets>,
}

impl HookRegistration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> HookName {
        self.name
    }

    /// Remove the handler. Safe to call repeatedly or after the registry is gone.
    pub fn unregister(&self) -> bool {
        match self.buckets.upgrade() {
            Some(buckets) => remove_from(&buckets, self.name, &self.id),
            None => false,
        }
    }
}

fn remove_from(buckets: &Buckets, name: HookName, id: &str) -> bool {
    let mut buckets = buckets.write();
    let Some(bucket) = buckets.get_mut(&name) else {
        return false;
    };
    let before = bucket.len();
    bucket.retain(|r| r.id != id);
    bucket.len() != before
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: HookName,
        handler: Arc<dyn HookHandler>,
        options: RegisterOptions,
    ) -> HookRegistration {
        let order = self.order.fetch_add(1, Ordering::Relaxed);
        let id = options
            .id
            .unwrap_or_else(|| format!("{}-{}", name.as_str(), order));

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(name).or_default();
        bucket.retain(|r| r.id != id);

        let priority = options.priority;
        // Insert after every entry with priority <= ours to keep registration order on ties.
        let at = bucket.partition_point(|r| (r.priority, r.order) <= (priority, order));
        bucket.insert(
            at,
            Registration {
                id: id.clone(),
                priority,
                order,
                handler,
            },
        );

        HookRegistration {
            name,
            id,
            buckets: Arc::downgrade(&self.buckets),
        }
    }

    /// Register the same handler on several hook points
    pub fn register_many(
        &self,
        names: &[HookName],
        handler: Arc<dyn HookHandler>,
        options: RegisterOptions,
    ) -> Vec<HookRegistration> {
        names
            .iter()
            .map(|name| {
                let mut options = options.clone();
                if let Some(id) = options.id.as_mut() {
                    id.push(':');
                    id.push_str(name.as_str());
                }
                self.register(*name, Arc::clone(&handler), options)
            })
            .collect()
    }

    pub fn unregister(&self, name: HookName, id: &str) -> bool {
        remove_from(&self.buckets, name, id)
    }

    pub fn clear(&self, name: Option<HookName>) {
        let mut buckets = self.buckets.write();
        match name {
            Some(name) => {
                buckets.remove(&name);
            }
            None => buckets.clear(),
        }
    }

    /// Handler ids for `name` in execution order
    pub fn handler_ids(&self, name: HookName) -> Vec<String> {
        self.buckets
            .read()
            .get(&name)
            .map(|bucket| bucket.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().values().all(Vec::is_empty)
    }

    /// Run every handler registered for the event's hook, in priority order
    pub async fn emit(&self, event: &mut HookEvent) -> HookReport {
        let handlers: Vec<(String, Arc<dyn HookHandler>)> = self
            .buckets
            .read()
            .get(&event.name())
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|r| (r.id.clone(), Arc::clone(&r.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = HookReport::default();
        for (handler_id, handler) in handlers {
            report.invoked += 1;
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "handler panicked".to_string(),
            };
            report.failures.push(HookFailure {
                handler_id,
                message,
            });
        }
        report
    }
}
