//! Routing of tasks into the gated and ungated schedulers, with the
//! counter bookkeeping that goes with every admission.
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sluice_queue::{Scheduler, Task, TaskStatus};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::manager::{AbstractCounter, EngineError, Tally};

/// One scheduler plus the bookkeeping of the workers bound to it.
pub struct Lane<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub name: &'static str,
    /// Gated lanes ask the counter for admission before executing tasks
    /// that carry a resource key.
    pub gated: bool,
    pub scheduler: Arc<Scheduler<D>>,
    busy: Arc<AtomicUsize>,
}

impl<D> Lane<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, gated: bool, scheduler: Scheduler<D>) -> Self {
        Self {
            name,
            gated,
            scheduler: Arc::new(scheduler),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of workers of this lane currently holding a task.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_busy(&self) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            busy: self.busy.clone(),
        }
    }
}

pub(crate) struct BusyGuard {
    busy: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Buffer handed to a computation. Spawned tasks join the parent's group;
/// emitted records are collected for that group's `submit` caller.
#[derive(Debug)]
pub struct Spawner<D: Clone> {
    group_id: String,
    tasks: Vec<Task<D>>,
    records: Vec<Value>,
}

impl<D: Clone> Spawner<D> {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            tasks: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn spawn(&mut self, task: Task<D>) {
        self.tasks.push(task.with_group(self.group_id.clone()));
    }

    pub fn emit(&mut self, record: impl Serialize) -> Result<(), serde_json::Error> {
        self.records.push(serde_json::to_value(record)?);
        Ok(())
    }

    pub fn spawned(&self) -> &[Task<D>] {
        &self.tasks
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub(crate) fn into_parts(self) -> (Vec<Task<D>>, Vec<Value>) {
        (self.tasks, self.records)
    }
}

pub struct Dispatcher<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub gated: Arc<Lane<D>>,
    pub ungated: Arc<Lane<D>>,
    pub counter: AbstractCounter,
    default_max_tries: u32,
    results: Mutex<HashMap<String, Vec<Value>>>,
}

impl<D> Dispatcher<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        gated: Scheduler<D>,
        ungated: Scheduler<D>,
        counter: AbstractCounter,
        default_max_tries: u32,
    ) -> Self {
        Self {
            gated: Arc::new(Lane::new("gated", true, gated)),
            ungated: Arc::new(Lane::new("ungated", false, ungated)),
            counter,
            default_max_tries,
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Tasks with a resource key go to the gated lane.
    pub fn lane_for(&self, task: &Task<D>) -> &Arc<Lane<D>> {
        if task.resource_key.is_some() {
            &self.gated
        } else {
            &self.ungated
        }
    }

    pub fn default_max_tries(&self) -> u32 {
        self.default_max_tries
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.counter.start().await?;
        self.gated.scheduler.start().await?;
        self.ungated.scheduler.start().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        self.gated.scheduler.close().await?;
        self.ungated.scheduler.close().await?;
        self.counter.close().await?;
        Ok(())
    }

    /// Admit a new task. Returns `false` when the duplicate filter rejects
    /// it. The task is counted before it becomes visible to workers, and
    /// the count is taken back when it is rejected.
    pub async fn add_task(&self, mut task: Task<D>) -> Result<bool, EngineError> {
        if task.max_tries.is_none() {
            task.max_tries = Some(self.default_max_tries);
        }
        task.set_status(TaskStatus::Queued);
        task.queued_at = SystemTime::now();

        let lane = self.lane_for(&task);
        self.counter.add(&task.group_id).await?;
        match lane.scheduler.produce(&task, false).await {
            Ok(true) => {
                tracing::trace!("[{}] Added {}", lane.name, task);
                Ok(true)
            }
            Ok(false) => {
                self.counter
                    .done(&task.family, &task.group_id, Tally::Transient)
                    .await?;
                Ok(false)
            }
            Err(e) => {
                self.counter
                    .done(&task.family, &task.group_id, Tally::Transient)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Put an already accepted task back for another attempt. Counted as a
    /// new admission; the caller reports the previous attempt as transient.
    pub async fn readmit(&self, task: &mut Task<D>) -> Result<(), EngineError> {
        task.set_status(TaskStatus::Queued);
        self.counter.add(&task.group_id).await?;
        if let Err(e) = self.lane_for(task).scheduler.produce(task, true).await {
            self.counter
                .done(&task.family, &task.group_id, Tally::Transient)
                .await?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Requeue a task whose attempt was interrupted. Its count never left
    /// the counter, so nothing is added.
    pub async fn put_back(&self, task: &mut Task<D>) -> Result<(), EngineError> {
        task.set_status(TaskStatus::Queued);
        self.lane_for(task).scheduler.produce(task, true).await?;
        Ok(())
    }

    pub fn record(&self, group_id: &str, records: Vec<Value>) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut results = self
            .results
            .lock()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        results
            .entry(group_id.to_string())
            .or_default()
            .extend(records);
        Ok(())
    }

    pub fn take_results(&self, group_id: &str) -> Result<Vec<Value>, EngineError> {
        let mut results = self
            .results
            .lock()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(results.remove(group_id).unwrap_or_default())
    }
}

impl<D> Debug for Dispatcher<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gated", &self.gated.scheduler)
            .field("ungated", &self.ungated.scheduler)
            .field("default_max_tries", &self.default_max_tries)
            .finish()
    }
}
