#![deny(clippy::unwrap_used)]
use derive_builder::Builder;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sluice_config::EngineConfig;
use sluice_queue::{Task, deadline};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::manager::{
    BusyGuard, Computation, ComputationError, CounterError, Dispatcher,
    EngineError, Hooks, Lane, Outcome, Spawner, Tally, WorkerStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Builder, Default, Clone, Debug)]
#[builder(public, setter(into))]
pub struct WorkerOptions {
    /// Retry budget for tasks that don't carry their own.
    #[builder(default = "3")]
    pub max_tries: u32,
    #[builder(default = "Duration::from_millis(500)")]
    pub capacity_retry_delay: Duration,
    #[builder(default = "None")]
    pub computation_timeout: Option<Duration>,
}

impl WorkerOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_tries: config.max_tries,
            capacity_retry_delay: config.capacity_retry_delay,
            computation_timeout: config.computation_timeout,
        }
    }
}

/// What an attempt produced, handed from the cancellable half of the
/// loop to the half that must run to completion.
#[derive(Debug)]
enum Step<Data: Clone> {
    Capacity(String),
    Done {
        outcome: Outcome,
        spawned: Vec<Task<Data>>,
        records: Vec<Value>,
        elapsed: Duration,
    },
}

pub struct Worker<Data, Comp, Ctx>
where
    Data: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    worker_id: WorkerId,
    ctx: Arc<Ctx>,
    computation: Arc<Comp>,
    dispatcher: Arc<Dispatcher<Data>>,
    lane: Arc<Lane<Data>>,
    hooks: Arc<Hooks<Data>>,
    in_hand: Option<Task<Data>>,
    busy: Option<BusyGuard>,
    pub stats: WorkerStats,
    pub options: WorkerOptions,
}

/// Fetches tasks from one lane, runs the computation and settles the
/// outcome with the counter. Only failures consume tries; a task is
/// dropped once its tries reach `max_tries`.
impl<Data, Comp, Ctx> Worker<Data, Comp, Ctx>
where
    Data: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Comp: Computation<Data, Ctx> + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    pub fn new(
        worker_id: WorkerId,
        ctx: Arc<Ctx>,
        computation: Arc<Comp>,
        dispatcher: Arc<Dispatcher<Data>>,
        lane: Arc<Lane<Data>>,
        hooks: Arc<Hooks<Data>>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            worker_id,
            ctx,
            computation,
            dispatcher,
            lane,
            hooks,
            in_hand: None,
            busy: None,
            stats: WorkerStats::new(),
            options,
        }
    }

    pub fn get_stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// One full iteration: wait for a task, execute it, settle it.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        if let Some(step) = self.attempt().await? {
            self.settle(step).await?;
        }
        Ok(())
    }

    /// Everything up to and including the computation. Safe to cancel:
    /// the task stays in `in_hand` until `settle` or `put_back` takes it.
    async fn attempt(&mut self) -> Result<Option<Step<Data>>, EngineError> {
        let task = match self.lane.scheduler.consume().await {
            Ok(task) => task,
            Err(e) => {
                error!("Error popping task: {:?}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(None);
            }
        };
        self.busy = Some(self.lane.mark_busy());
        let task = self.in_hand.insert(task);
        let started = Instant::now();

        let admission = match (self.lane.gated, task.resource_key.as_deref()) {
            (true, Some(key)) => {
                match self.dispatcher.counter.require_admission(key).await {
                    Ok(admission) => Some(admission),
                    Err(CounterError::Capacity(reason)) => {
                        return Ok(Some(Step::Capacity(reason)));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ => None,
        };

        let mut spawner = Spawner::new(task.group_id.clone());
        let result = match self.hooks.before_execute(task).await {
            Err(signal) => Err(signal),
            Ok(()) => {
                task.set_in_progress();
                let _active = admission
                    .as_ref()
                    .map(|_| self.dispatcher.counter.limiter().begin_active());
                let call = self.computation.call(
                    self.worker_id,
                    self.ctx.clone(),
                    task,
                    &mut spawner,
                );
                match self.options.computation_timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or_else(|_| Err(ComputationError::Timeout(limit))),
                    None => call.await,
                }
            }
        };
        drop(admission);

        let outcome = Outcome::from(result);
        self.hooks.after_execute(task, &outcome).await;
        let (spawned, records) = spawner.into_parts();
        Ok(Some(Step::Done {
            outcome,
            spawned,
            records,
            elapsed: started.elapsed(),
        }))
    }

    /// Forward what the attempt produced and close its bookkeeping.
    /// Counter errors are returned; queue errors are logged.
    async fn settle(&mut self, step: Step<Data>) -> Result<(), EngineError> {
        let result = match self.in_hand.take() {
            Some(mut task) => match step {
                Step::Capacity(reason) => {
                    self.capacity_refused(&mut task, &reason).await
                }
                Step::Done {
                    outcome,
                    spawned,
                    records,
                    elapsed,
                } => {
                    self.stats.record_execution_time(elapsed);
                    match self.forward(&task, spawned, records).await {
                        Ok(()) => self.apply(&mut task, outcome).await,
                        Err(e) => Err(e),
                    }
                }
            },
            None => Ok(()),
        };
        self.busy = None;
        result
    }

    /// Requeue the task of an interrupted attempt. Nothing was counted for
    /// the attempt, so the counter is left alone.
    pub async fn put_back(&mut self) {
        if let Some(mut task) = self.in_hand.take() {
            match self.dispatcher.put_back(&mut task).await {
                Ok(()) => info!("Put back {}", task),
                Err(e) => error!("Failed to put back {}: {}", task, e),
            }
        }
        self.busy = None;
    }

    async fn forward(
        &self,
        parent: &Task<Data>,
        spawned: Vec<Task<Data>>,
        records: Vec<Value>,
    ) -> Result<(), EngineError> {
        for child in spawned {
            match self.dispatcher.add_task(child).await {
                Ok(_) => {}
                Err(EngineError::Counter(e)) => return Err(e.into()),
                Err(e) => error!("Failed to add task spawned by {}: {}", parent, e),
            }
        }
        self.dispatcher.record(&parent.group_id, records)
    }

    async fn apply(
        &mut self,
        task: &mut Task<Data>,
        outcome: Outcome,
    ) -> Result<(), EngineError> {
        match outcome {
            Outcome::Success => {
                task.set_succeed();
                if let Some(interval) = task.recrawl {
                    task.tries = 0;
                    let base = task.last_started_at.unwrap_or_else(SystemTime::now);
                    task.defer_until(deadline(base, interval));
                    self.readmit(task).await?;
                }
                self.done(task, Tally::Success).await?;
                self.stats.record_success();
                debug!("Task {} succeed", task);
            }
            Outcome::SoftSkip => {
                self.done(task, Tally::Success).await?;
                self.stats.record_skip();
                debug!("Task {} skipped", task);
            }
            Outcome::Reschedule { delay, recrawl } => {
                if recrawl.is_some() {
                    task.recrawl = recrawl;
                }
                task.defer_until(deadline(SystemTime::now(), delay));
                self.requeue(task).await?;
                self.stats.record_reschedule();
                debug!("Task {} rescheduled in {:?}", task, delay);
            }
            Outcome::Failure(error_msg) => {
                task.set_retry(&error_msg);
                let max_tries = task.max_tries.unwrap_or(self.options.max_tries);
                if !task.ignore_errors && task.tries < max_tries {
                    task.defer_until(SystemTime::now());
                    self.requeue(task).await?;
                    self.stats.record_retry();
                    warn!(
                        "Task {} failed, retrying ({}/{}): {}",
                        task, task.tries, max_tries, error_msg
                    );
                } else {
                    task.set_dlq(&error_msg);
                    self.done(task, Tally::Failure).await?;
                    self.stats.record_failure();
                    error!(
                        "Task {} dropped after {} tries: {}",
                        task, task.tries, error_msg
                    );
                }
            }
        }
        Ok(())
    }

    async fn capacity_refused(
        &mut self,
        task: &mut Task<Data>,
        reason: &str,
    ) -> Result<(), EngineError> {
        task.defer_until(deadline(
            SystemTime::now(),
            self.options.capacity_retry_delay,
        ));
        self.requeue(task).await?;
        self.stats.record_reschedule();
        debug!("Task {} postponed: {}", task, reason);
        Ok(())
    }

    /// Count a fresh admission of `task`. The new entry is counted before
    /// the old one is closed so joins never see a spurious zero.
    async fn readmit(&self, task: &mut Task<Data>) -> Result<(), EngineError> {
        match self.dispatcher.readmit(task).await {
            Ok(()) => Ok(()),
            Err(EngineError::Counter(e)) => Err(e.into()),
            Err(e) => {
                error!("Failed to requeue {}: {}", task, e);
                Ok(())
            }
        }
    }

    async fn requeue(&self, task: &mut Task<Data>) -> Result<(), EngineError> {
        self.readmit(task).await?;
        self.done(task, Tally::Transient).await
    }

    async fn done(&self, task: &Task<Data>, tally: Tally) -> Result<(), EngineError> {
        self.dispatcher
            .counter
            .done(&task.family, &task.group_id, tally)
            .await?;
        Ok(())
    }
}

impl<Data, Comp, Ctx> std::fmt::Debug for Worker<Data, Comp, Ctx>
where
    Data: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("lane", &self.lane.name)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Drives a worker until `terminate` fires. A terminated worker puts its
/// in-hand task back. A counter error stops the whole engine through
/// `stop` and is returned.
#[instrument(skip_all, fields(worker_id = %worker.worker_id, lane = worker.lane.name))]
pub async fn worker_wrapper<Data, Comp, Ctx>(
    mut worker: Worker<Data, Comp, Ctx>,
    mut terminate: broadcast::Receiver<()>,
    stop: Arc<watch::Sender<bool>>,
) -> Result<WorkerStats, EngineError>
where
    Data: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    Comp: Computation<Data, Ctx> + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = terminate.recv() => {
                worker.put_back().await;
                info!("Terminated");
                return Ok(worker.stats);
            },
            step = worker.attempt() => {
                let settled = match step {
                    Ok(Some(step)) => worker.settle(step).await,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                if let Err(e) = settled {
                    error!("Worker stopped on fatal error: {}", e);
                    worker.put_back().await;
                    stop.send_replace(true);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manager::{Counter, LocalCounter, ResourceLimiter};
    use async_trait::async_trait;
    use serde::Deserialize;
    use sluice_queue::{Scheduler, TaskStatus};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum Job {
        Ok,
        Fail,
        Skip,
        Reschedule,
        /// Reschedules and asks for a 30s recrawl interval.
        Recrawl,
        Slow,
        Spawn(u32),
    }

    struct TestComputation;

    #[async_trait]
    impl Computation<Job, ()> for TestComputation {
        async fn call(
            &self,
            _worker_id: WorkerId,
            _ctx: Arc<()>,
            task: &mut Task<Job>,
            spawner: &mut Spawner<Job>,
        ) -> Result<(), ComputationError> {
            match task.payload {
                Job::Ok => Ok(()),
                Job::Fail => Err(ComputationError::Function("boom".into())),
                Job::Skip => Err(ComputationError::Skip),
                Job::Reschedule => Err(ComputationError::reschedule(
                    Duration::from_millis(1),
                )),
                Job::Recrawl => Err(ComputationError::Reschedule {
                    delay: Duration::from_millis(1),
                    recrawl: Some(Duration::from_secs(30)),
                }),
                Job::Slow => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
                Job::Spawn(n) => {
                    for _ in 0..n {
                        spawner.spawn(Task::new(Job::Ok));
                    }
                    spawner.emit(serde_json::json!({"children": n}))?;
                    Ok(())
                }
            }
        }
    }

    fn setup(
        limiter: ResourceLimiter,
        options: WorkerOptions,
    ) -> (
        Worker<Job, TestComputation, ()>,
        Arc<Dispatcher<Job>>,
        Arc<LocalCounter>,
    ) {
        let counter = Arc::new(LocalCounter::new(limiter, false));
        let dispatcher = Arc::new(Dispatcher::new(
            Scheduler::in_memory("gated", Duration::from_millis(10)),
            Scheduler::in_memory("ungated", Duration::from_millis(10)),
            counter.clone(),
            options.max_tries,
        ));
        let worker = Worker::new(
            WorkerId::new(1),
            Arc::new(()),
            Arc::new(TestComputation),
            dispatcher.clone(),
            dispatcher.ungated.clone(),
            Arc::new(Hooks::new()),
            options,
        );
        (worker, dispatcher, counter)
    }

    fn options() -> WorkerOptions {
        WorkerOptionsBuilder::default()
            .max_tries(3u32)
            .computation_timeout(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_task_is_counted() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher.add_task(Task::new(Job::Ok)).await.unwrap();

        worker.run().await.unwrap();

        assert_eq!(worker.stats.tasks_succeeded, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 0);
        assert_eq!(counter.counts().await.unwrap()["Task"].success, 1);
    }

    #[tokio::test]
    async fn failed_task_is_retried_then_dropped() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher.add_task(Task::new(Job::Fail)).await.unwrap();

        for _ in 0..2 {
            worker.run().await.unwrap();
            assert_eq!(counter.in_flight().await.unwrap(), 1);
        }
        let retried = dispatcher.ungated.scheduler.try_consume().await.unwrap().unwrap();
        assert_eq!(retried.tries, 2);
        assert_eq!(retried.status, TaskStatus::Queued);
        dispatcher.put_back(&mut retried.clone()).await.unwrap();

        worker.run().await.unwrap();
        assert_eq!(worker.stats.tasks_retried, 2);
        assert_eq!(worker.stats.tasks_failed, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 0);
        assert_eq!(counter.counts().await.unwrap()["Task"].failure, 1);
        assert!(dispatcher.ungated.scheduler.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let (mut worker, dispatcher, _) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher.add_task(Task::new(Job::Slow)).await.unwrap();

        worker.run().await.unwrap();

        assert_eq!(worker.stats.tasks_retried, 1);
        let task = dispatcher.ungated.scheduler.try_consume().await.unwrap().unwrap();
        assert_eq!(task.tries, 1);
        assert!(task.error_msg.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn ignoring_errors_drops_on_first_failure() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher
            .add_task(Task::new(Job::Fail).ignoring_errors())
            .await
            .unwrap();

        worker.run().await.unwrap();

        assert_eq!(worker.stats.tasks_failed, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skip_and_reschedule_keep_tries() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher.add_task(Task::new(Job::Skip)).await.unwrap();
        worker.run().await.unwrap();
        assert_eq!(worker.stats.tasks_skipped, 1);
        assert_eq!(counter.counts().await.unwrap()["Task"].success, 1);

        dispatcher.add_task(Task::new(Job::Reschedule)).await.unwrap();
        for _ in 0..5 {
            worker.run().await.unwrap();
        }
        assert_eq!(worker.stats.tasks_rescheduled, 5);
        assert_eq!(counter.in_flight().await.unwrap(), 1);
        let task = dispatcher.ungated.scheduler.consume().await.unwrap();
        assert_eq!(task.tries, 0);
    }

    #[tokio::test]
    async fn recrawl_readmits_succeeded_task() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        let mut task = Task::new(Job::Ok).with_recrawl(Duration::from_secs(60));
        task.tries = 2;
        dispatcher.add_task(task).await.unwrap();

        worker.run().await.unwrap();

        assert_eq!(worker.stats.tasks_succeeded, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 1);
        assert_eq!(counter.counts().await.unwrap()["Task"].success, 1);
        let queued = dispatcher.ungated.scheduler.queue().drain().await.unwrap();
        assert_eq!(queued.len(), 1);
        let started = queued[0].last_started_at.unwrap();
        assert_eq!(queued[0].tries, 0);
        assert_eq!(queued[0].status, TaskStatus::Queued);
        assert_eq!(queued[0].ready_at, started + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn reschedule_replaces_recrawl_interval() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher
            .add_task(Task::new(Job::Recrawl).with_recrawl(Duration::from_secs(5)))
            .await
            .unwrap();

        worker.run().await.unwrap();
        assert_eq!(worker.stats.tasks_rescheduled, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 1);

        let mut task = dispatcher.ungated.scheduler.consume().await.unwrap();
        assert_eq!(task.recrawl, Some(Duration::from_secs(30)));
        assert_eq!(task.tries, 0);

        // The next success is spaced by the new interval.
        task.payload = Job::Ok;
        dispatcher.put_back(&mut task).await.unwrap();
        worker.run().await.unwrap();
        let queued = dispatcher.ungated.scheduler.queue().drain().await.unwrap();
        let started = queued[0].last_started_at.unwrap();
        assert_eq!(queued[0].ready_at, started + Duration::from_secs(30));
        assert_eq!(counter.in_flight().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recrawling_task_never_settles() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher
            .add_task(Task::new(Job::Ok).with_recrawl(Duration::from_millis(20)))
            .await
            .unwrap();

        for round in 1..=3 {
            worker.run().await.unwrap();
            assert_eq!(worker.stats.tasks_succeeded, round);
            assert_eq!(counter.in_flight().await.unwrap(), 1);
        }
        assert_eq!(counter.counts().await.unwrap()["Task"].success, 3);
        assert!(!counter.is_idle().await.unwrap());
    }

    #[tokio::test]
    async fn children_are_added_before_parent_is_done() {
        let (mut worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), options());
        dispatcher
            .add_task(Task::new(Job::Spawn(2)).with_group("g"))
            .await
            .unwrap();

        worker.run().await.unwrap();

        assert_eq!(counter.group_in_flight("g").await.unwrap(), 2);
        assert_eq!(
            dispatcher.take_results("g").unwrap(),
            vec![serde_json::json!({"children": 2})]
        );
        for _ in 0..2 {
            worker.run().await.unwrap();
        }
        assert_eq!(counter.group_in_flight("g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capacity_refusal_requeues_without_a_try() {
        let limiter = ResourceLimiter::new(1, Vec::new(), Duration::ZERO, Vec::new());
        let held = limiter.try_admit("example.com").unwrap();
        let (_, dispatcher, counter) = setup(limiter, options());
        let mut worker = Worker::new(
            WorkerId::new(2),
            Arc::new(()),
            Arc::new(TestComputation),
            dispatcher.clone(),
            dispatcher.gated.clone(),
            Arc::new(Hooks::new()),
            options(),
        );
        dispatcher
            .add_task(Task::new(Job::Ok).with_resource_key("example.com"))
            .await
            .unwrap();

        worker.run().await.unwrap();
        assert_eq!(worker.stats.tasks_rescheduled, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 1);

        drop(held);
        worker.run().await.unwrap();
        assert_eq!(worker.stats.tasks_succeeded, 1);
        assert_eq!(counter.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminated_worker_puts_task_back() {
        let (worker, dispatcher, counter) =
            setup(ResourceLimiter::unlimited(), WorkerOptions::default());
        dispatcher.add_task(Task::new(Job::Slow)).await.unwrap();

        let (terminate, receiver) = broadcast::channel(1);
        let (stop, _) = watch::channel(false);
        let handle = tokio::spawn(worker_wrapper(worker, receiver, Arc::new(stop)));
        while dispatcher.ungated.busy() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        terminate.send(()).unwrap();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.tasks_processed, 0);
        assert_eq!(dispatcher.ungated.busy(), 0);
        assert_eq!(counter.in_flight().await.unwrap(), 1);
        let task = dispatcher.ungated.scheduler.try_consume().await.unwrap().unwrap();
        assert_eq!(task.tries, 0);
    }

    #[test]
    fn worker_options() {
        let options = WorkerOptionsBuilder::default().build().unwrap();
        assert_eq!(options.max_tries, 3);
        assert_eq!(options.capacity_retry_delay, Duration::from_millis(500));
        assert_eq!(options.computation_timeout, None);
    }
}
