//! Per-agent run leases
//!
//! The coordinator keeps an in-memory table of active runs keyed by agent.
//! Acquisition is a compatibility check: it fails when any run already active
//! for the key has a type outside the caller's allowed set. Contention is
//! reported as `None`, never as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AgentKey, RunType};

/// Descriptor of one active run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    pub agent_key: AgentKey,
    pub run_id: String,
    pub run_type: RunType,
    pub started_at: DateTime<Utc>,
}

/// Parameters for [`AgentRunCoordinator::acquire_with_timeout`]
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Run types that may stay active alongside the new run
    pub allowed_active: Vec<RunType>,
    pub timeout: Duration,
    /// Upper bound on each wait between attempts
    pub poll_interval: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            allowed_active: Vec::new(),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(150),
        }
    }
}

#[derive(Default)]
struct Shared {
    runs: Mutex<HashMap<AgentKey, Vec<ActiveRun>>>,
    released: Notify,
}

impl Shared {
    fn remove(&self, agent_key: &AgentKey, run_id: &str) -> Option<ActiveRun> {
        let removed = {
            let mut runs = self.runs.lock();
            let bucket = runs.get_mut(agent_key)?;
            let index = bucket.iter().position(|run| run.run_id == run_id)?;
            let removed = bucket.remove(index);
            if bucket.is_empty() {
                runs.remove(agent_key);
            }
            removed
        };
        self.released.notify_waiters();
        Some(removed)
    }
}

/// Shared handle to the lease table. Cloning is cheap.
#[derive(Clone, Default)]
pub struct AgentRunCoordinator {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for AgentRunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunCoordinator")
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

impl AgentRunCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run for `agent_key` unless an incompatible run is active.
    ///
    /// `allowed_active` lists the run types that may remain active next to
    /// the new one. An empty slice makes the acquisition exclusive.
    pub fn try_acquire(
        &self,
        agent_key: &AgentKey,
        run_type: RunType,
        allowed_active: &[RunType],
    ) -> Option<RunLease> {
        let run = {
            let mut runs = self.inner.runs.lock();
            let bucket = runs.entry(agent_key.clone()).or_default();
            if bucket
                .iter()
                .any(|active| !allowed_active.contains(&active.run_type))
            {
                return None;
            }
            let run = ActiveRun {
                agent_key: agent_key.clone(),
                run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
                run_type,
                started_at: Utc::now(),
            };
            bucket.push(run.clone());
            run
        };

        Some(RunLease {
            shared: Arc::downgrade(&self.inner),
            run,
            released: AtomicBool::new(false),
        })
    }

    /// Retry [`try_acquire`](Self::try_acquire) until it succeeds or the
    /// timeout elapses. Wakes early whenever any lease is released.
    pub async fn acquire_with_timeout(
        &self,
        agent_key: &AgentKey,
        run_type: RunType,
        options: &AcquireOptions,
    ) -> Option<RunLease> {
        let deadline = Instant::now() + options.timeout;
        let poll_interval = options.poll_interval.max(Duration::from_millis(1));

        loop {
            // Register interest before checking so a release in between is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(agent_key, run_type, &options.allowed_active) {
                return Some(lease);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    pub fn is_active(&self, agent_key: &AgentKey) -> bool {
        self.inner
            .runs
            .lock()
            .get(agent_key)
            .is_some_and(|bucket| !bucket.is_empty())
    }

    pub fn active_run_types(&self, agent_key: &AgentKey) -> Vec<RunType> {
        let runs = self.inner.runs.lock();
        let mut types: Vec<RunType> = Vec::new();
        for run in runs.get(agent_key).into_iter().flatten() {
            if !types.contains(&run.run_type) {
                types.push(run.run_type);
            }
        }
        types
    }

    pub fn active_runs(&self, agent_key: &AgentKey) -> Vec<ActiveRun> {
        self.inner
            .runs
            .lock()
            .get(agent_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn active_keys(&self) -> Vec<AgentKey> {
        let mut keys: Vec<AgentKey> = self.inner.runs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Force-release every run that started before `now - max_age`.
    ///
    /// Never called by the coordinator itself. The holder's guard becomes
    /// inert: its later `release()` returns false.
    pub fn release_stale(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<ActiveRun> {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale: Vec<ActiveRun> = {
            let mut runs = self.inner.runs.lock();
            let mut stale = Vec::new();
            runs.retain(|_, bucket| {
                bucket.retain(|run| {
                    if run.started_at < cutoff {
                        stale.push(run.clone());
                        false
                    } else {
                        true
                    }
                });
                !bucket.is_empty()
            });
            stale
        };

        if !stale.is_empty() {
            self.inner.released.notify_waiters();
        }
        stale
    }
}

/// Occupancy of one agent key. Released on drop.
pub struct RunLease {
    shared: Weak<Shared>,
    run: ActiveRun,
    released: AtomicBool,
}

impl RunLease {
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn agent_key(&self) -> &AgentKey {
        &self.run.agent_key
    }

    pub fn run_type(&self) -> RunType {
        self.run.run_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.run.started_at
    }

    pub fn descriptor(&self) -> &ActiveRun {
        &self.run
    }

    /// Remove the run from the active set. Only the first call has effect;
    /// returns whether this call removed it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.shared.upgrade() {
            Some(shared) => shared.remove(&self.run.agent_key, &self.run.run_id).is_some(),
            None => false,
        }
    }
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease")
            .field("run", &self.run)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AgentKey {
        AgentKey::from(s)
    }

    #[test]
    fn second_incompatible_acquire_is_rejected_until_release() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");

        let lease = coordinator
            .try_acquire(&agent, RunType::User, &[])
            .expect("first acquire");
        assert!(coordinator.try_acquire(&agent, RunType::User, &[]).is_none());
        assert!(coordinator
            .try_acquire(&agent, RunType::Heartbeat, &[])
            .is_none());

        assert!(lease.release());
        assert!(!lease.release());
        assert!(!coordinator.is_active(&agent));

        let again = coordinator.try_acquire(&agent, RunType::User, &[]);
        assert!(again.is_some());
    }

    #[test]
    fn compatible_runs_coexist() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");

        let _parent = coordinator
            .try_acquire(&agent, RunType::User, &[])
            .expect("parent");
        let _nested = coordinator
            .try_acquire(&agent, RunType::Autonomy, &[RunType::User])
            .expect("nested autonomy allowed next to user");

        assert_eq!(
            coordinator.active_run_types(&agent),
            vec![RunType::User, RunType::Autonomy]
        );
        // The nested autonomy run is not in the heartbeat's allowed set.
        assert!(coordinator
            .try_acquire(&agent, RunType::Heartbeat, &[RunType::User])
            .is_none());
    }

    #[test]
    fn keys_are_independent() {
        let coordinator = AgentRunCoordinator::new();
        let _a = coordinator
            .try_acquire(&key("a"), RunType::User, &[])
            .expect("a");
        let _b = coordinator
            .try_acquire(&key("b"), RunType::User, &[])
            .expect("b");
        assert_eq!(coordinator.active_keys(), vec![key("a"), key("b")]);
    }

    #[test]
    fn dropping_the_guard_releases() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");
        {
            let _lease = coordinator.try_acquire(&agent, RunType::User, &[]);
            assert!(coordinator.is_active(&agent));
        }
        assert!(!coordinator.is_active(&agent));
        assert!(coordinator.active_runs(&agent).is_empty());
    }

    #[test]
    fn reaped_lease_release_is_a_no_op() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");
        let lease = coordinator
            .try_acquire(&agent, RunType::Heartbeat, &[])
            .expect("acquire");

        let fresh = coordinator.release_stale(Duration::from_secs(60), Utc::now());
        assert!(fresh.is_empty());

        let later = Utc::now() + chrono::Duration::minutes(5);
        let reaped = coordinator.release_stale(Duration::from_secs(60), later);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].run_id, lease.run_id());

        let replacement = coordinator
            .try_acquire(&agent, RunType::User, &[])
            .expect("slot is free after reaping");
        assert!(!lease.release());
        assert!(coordinator.is_active(&agent));
        drop(replacement);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_timeout_gives_up_at_deadline() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");
        let _held = coordinator.try_acquire(&agent, RunType::User, &[]);

        let started = Instant::now();
        let options = AcquireOptions {
            timeout: Duration::from_millis(500),
            ..AcquireOptions::default()
        };
        let lease = coordinator
            .acquire_with_timeout(&agent, RunType::User, &options)
            .await;
        assert!(lease.is_none());
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_timeout_wakes_on_release() {
        let coordinator = AgentRunCoordinator::new();
        let agent = key("agent-a");
        let held = coordinator
            .try_acquire(&agent, RunType::User, &[])
            .expect("held");

        let waiter = {
            let coordinator = coordinator.clone();
            let agent = agent.clone();
            tokio::spawn(async move {
                let options = AcquireOptions {
                    timeout: Duration::from_secs(5),
                    poll_interval: Duration::from_secs(1),
                    ..AcquireOptions::default()
                };
                coordinator
                    .acquire_with_timeout(&agent, RunType::Heartbeat, &options)
                    .await
                    .map(|lease| lease.run_type())
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(held);

        let acquired = waiter.await.expect("join");
        assert_eq!(acquired, Some(RunType::Heartbeat));
    }
}
