//! In-flight bookkeeping, per-family tallies and group joins.
//!
//! Every task the engine accepts is `add`ed once and `done` once. Retries
//! and reschedules re-add the task before reporting the previous attempt
//! as `Tally::Transient`, so neither the global nor the group count drops
//! to zero while the task is still alive.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

use crate::manager::{Admission, ResourceLimiter};

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("No free slot for resource {0}")]
    Capacity(String),
    #[error("task done() called more times than add() for group {group}")]
    Underflow { group: String },
    #[error("Counter backend error: {0}")]
    Backend(String),
}

/// How an attempt ended, as far as bookkeeping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    Success,
    Failure,
    /// The task went back to a queue; tallies are untouched.
    Transient,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyCounts {
    pub success: u64,
    pub failure: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub in_flight: u64,
    pub groups: BTreeMap<String, u64>,
    pub counts: BTreeMap<String, FamilyCounts>,
}

#[async_trait]
pub trait Counter: Send + Sync {
    async fn start(&self) -> Result<(), CounterError> {
        Ok(())
    }

    async fn add(&self, group: &str) -> Result<(), CounterError>;

    async fn done(
        &self,
        family: &str,
        group: &str,
        tally: Tally,
    ) -> Result<(), CounterError>;

    /// Wait until nothing is in flight. In always-locked mode wait until
    /// `unlock` is called instead.
    async fn join(&self) -> Result<(), CounterError>;

    /// Wait until nothing of `group` is in flight.
    async fn join_group(&self, group: &str) -> Result<(), CounterError>;

    async fn in_flight(&self) -> Result<u64, CounterError>;

    async fn group_in_flight(&self, group: &str) -> Result<u64, CounterError>;

    async fn counts(&self) -> Result<BTreeMap<String, FamilyCounts>, CounterError>;

    async fn snapshot(&self) -> Result<CounterSnapshot, CounterError>;

    async fn restore(&self, snapshot: CounterSnapshot) -> Result<(), CounterError>;

    /// True when nothing is in flight, regardless of always-locked mode.
    async fn is_idle(&self) -> Result<bool, CounterError> {
        Ok(self.in_flight().await? == 0)
    }

    /// Release every `join` waiter, including always-locked ones.
    fn unlock(&self);

    fn limiter(&self) -> &ResourceLimiter;

    /// Pace, then reserve the budgets of `resource_key`.
    async fn require_admission(
        &self,
        resource_key: &str,
    ) -> Result<Admission, CounterError> {
        self.limiter().admit(resource_key).await
    }

    async fn close(&self) -> Result<(), CounterError> {
        Ok(())
    }
}

pub type AbstractCounter = Arc<dyn Counter + Send + Sync>;

#[derive(Debug, Default)]
struct CounterState {
    in_flight: u64,
    groups: HashMap<String, u64>,
    counts: BTreeMap<String, FamilyCounts>,
}

/// Process-local counter. Waiters are woken through a `Notify` on every
/// change instead of polling.
pub struct LocalCounter {
    state: Mutex<CounterState>,
    changed: Notify,
    lock_always: bool,
    unlocked: AtomicBool,
    limiter: ResourceLimiter,
}

impl LocalCounter {
    pub fn new(limiter: ResourceLimiter, lock_always: bool) -> Self {
        Self {
            state: Mutex::new(CounterState::default()),
            changed: Notify::new(),
            lock_always,
            unlocked: AtomicBool::new(false),
            limiter,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CounterState>, CounterError> {
        self.state
            .lock()
            .map_err(|e| CounterError::Backend(e.to_string()))
    }
}

impl Default for LocalCounter {
    fn default() -> Self {
        Self::new(ResourceLimiter::unlimited(), false)
    }
}

#[async_trait]
impl Counter for LocalCounter {
    async fn add(&self, group: &str) -> Result<(), CounterError> {
        let mut state = self.lock()?;
        state.in_flight += 1;
        *state.groups.entry(group.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn done(
        &self,
        family: &str,
        group: &str,
        tally: Tally,
    ) -> Result<(), CounterError> {
        {
            let mut state = self.lock()?;
            let group_count = state.groups.get(group).copied().unwrap_or(0);
            if group_count == 0 || state.in_flight == 0 {
                return Err(CounterError::Underflow {
                    group: group.to_string(),
                });
            }
            state.in_flight -= 1;
            if group_count == 1 {
                state.groups.remove(group);
            } else {
                state.groups.insert(group.to_string(), group_count - 1);
            }
            match tally {
                Tally::Success => {
                    state.counts.entry(family.to_string()).or_default().success += 1
                }
                Tally::Failure => {
                    state.counts.entry(family.to_string()).or_default().failure += 1
                }
                Tally::Transient => {}
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn join(&self) -> Result<(), CounterError> {
        loop {
            let notified = self.changed.notified();
            if self.unlocked.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !self.lock_always && self.lock()?.in_flight == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn join_group(&self, group: &str) -> Result<(), CounterError> {
        loop {
            let notified = self.changed.notified();
            if !self.lock()?.groups.contains_key(group) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn in_flight(&self) -> Result<u64, CounterError> {
        Ok(self.lock()?.in_flight)
    }

    async fn group_in_flight(&self, group: &str) -> Result<u64, CounterError> {
        Ok(self.lock()?.groups.get(group).copied().unwrap_or(0))
    }

    async fn counts(&self) -> Result<BTreeMap<String, FamilyCounts>, CounterError> {
        Ok(self.lock()?.counts.clone())
    }

    async fn snapshot(&self) -> Result<CounterSnapshot, CounterError> {
        let state = self.lock()?;
        Ok(CounterSnapshot {
            in_flight: state.in_flight,
            groups: state
                .groups
                .iter()
                .map(|(g, n)| (g.clone(), *n))
                .collect(),
            counts: state.counts.clone(),
        })
    }

    async fn restore(&self, snapshot: CounterSnapshot) -> Result<(), CounterError> {
        {
            let mut state = self.lock()?;
            state.in_flight = snapshot.in_flight;
            state.groups = snapshot
                .groups
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .collect();
            state.counts = snapshot.counts;
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }
}

impl std::fmt::Debug for LocalCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCounter")
            .field("lock_always", &self.lock_always)
            .field("limiter", &self.limiter)
            .finish()
    }
}
