//! Hooks let callers observe and steer task execution at fixed points.
//! Registrations are kept sorted by priority, highest first; equal
//! priorities keep registration order. A registration with a `family`
//! only sees tasks of that family.
use async_trait::async_trait;
use sluice_queue::Task;
use std::sync::Arc;

use crate::manager::{ComputationError, Outcome};

#[async_trait]
pub trait Hook<Data>: Send + Sync
where
    Data: Clone + Send + Sync + 'static,
{
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returning `Skip` or `Reschedule` short-circuits the attempt, any
    /// other error counts as a failed attempt.
    async fn before_execute(
        &self,
        _task: &mut Task<Data>,
    ) -> Result<(), ComputationError> {
        Ok(())
    }

    async fn after_execute(&self, _task: &Task<Data>, _outcome: &Outcome) {}

    async fn on_close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct HookRegistration<Data> {
    pub family: Option<String>,
    pub priority: i32,
    pub hook: Arc<dyn Hook<Data>>,
}

impl<Data> HookRegistration<Data>
where
    Data: Clone + Send + Sync + 'static,
{
    pub fn new(hook: impl Hook<Data> + 'static) -> Self {
        Self {
            family: None,
            priority: 0,
            hook: Arc::new(hook),
        }
    }

    pub fn for_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn applies_to(&self, task: &Task<Data>) -> bool {
        self.family.as_deref().is_none_or(|f| f == task.family)
    }
}

pub struct Hooks<Data> {
    registrations: Vec<HookRegistration<Data>>,
}

impl<Data> Default for Hooks<Data> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }
}

impl<Data> Hooks<Data>
where
    Data: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: HookRegistration<Data>) {
        let at = self
            .registrations
            .partition_point(|r| r.priority >= registration.priority);
        self.registrations.insert(at, registration);
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub async fn on_start(&self) -> anyhow::Result<()> {
        for registration in &self.registrations {
            registration.hook.on_start().await?;
        }
        Ok(())
    }

    pub async fn before_execute(
        &self,
        task: &mut Task<Data>,
    ) -> Result<(), ComputationError> {
        for registration in &self.registrations {
            if registration.applies_to(task) {
                registration.hook.before_execute(task).await?;
            }
        }
        Ok(())
    }

    pub async fn after_execute(&self, task: &Task<Data>, outcome: &Outcome) {
        for registration in &self.registrations {
            if registration.applies_to(task) {
                registration.hook.after_execute(task, outcome).await;
            }
        }
    }

    /// Runs every hook even if some fail; failures are logged.
    pub async fn on_close(&self) {
        for registration in &self.registrations {
            if let Err(e) = registration.hook.on_close().await {
                tracing::error!("Hook on_close failed: {:#}", e);
            }
        }
    }
}
