//! The engine wires two lanes of workers to a shared counter and drives a
//! run from start to shutdown:
//!
//! 1. start backends, restore the last snapshot, run `on_start` hooks;
//! 2. spawn `request_workers` gated and `workers` ungated workers;
//! 3. wait until the counter drains, a stop is requested or Ctrl+C;
//! 4. stop the gated lane, let the ungated lane finish its ready work,
//!    stop it, run `on_close` hooks and save a snapshot.
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sluice_config::{BackendConfig, BackendKind, ConfigError, Configurable, EngineConfig};
use sluice_queue::{
    AbstractDuplicateFilter, AbstractTaskQueue, InMemoryDuplicateFilter,
    InMemoryTaskQueue, Scheduler, Task, TaskQueueError,
};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::manager::{
    AbstractCounter, Computation, CounterError, Dispatcher,
    EngineSnapshot, EngineStats, HookRegistration, Hooks, Lane, LocalCounter,
    ResourceLimiter, Worker, WorkerId, WorkerOptions, WorkerStats, worker_wrapper,
};

/// Ungated lane must look idle this many times in a row before shutdown
/// proceeds.
const QUIET_CHECKS: usize = 2;
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Queue error: {0}")]
    Queue(#[from] TaskQueueError),
    #[error("Counter error: {0}")]
    Counter(#[from] CounterError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Hook error: {0:#}")]
    Hook(anyhow::Error),
    #[error("Worker crashed: {0}")]
    Worker(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] rustis::Error),
}

/// Cloneable control surface of a running engine.
pub struct EngineHandle<Data>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    dispatcher: Arc<Dispatcher<Data>>,
    stop: Arc<watch::Sender<bool>>,
    started_at: Instant,
}

impl<Data> Clone for EngineHandle<Data>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            stop: self.stop.clone(),
            started_at: self.started_at,
        }
    }
}

impl<Data> EngineHandle<Data>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Ask the engine to shut down, including an always-locked one.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        self.dispatcher.counter.unlock();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub async fn add_task(&self, task: Task<Data>) -> Result<bool, EngineError> {
        self.dispatcher.add_task(task).await
    }

    /// Add `tasks` as the cohort `group_id`, wait until the cohort and
    /// everything it spawned has settled, and return the records emitted
    /// on its behalf.
    pub async fn submit(
        &self,
        tasks: Vec<Task<Data>>,
        group_id: impl Into<String>,
    ) -> Result<Vec<Value>, EngineError> {
        let group_id = group_id.into();
        for task in tasks {
            self.dispatcher
                .add_task(task.with_group(group_id.clone()))
                .await?;
        }
        self.dispatcher.counter.join_group(&group_id).await?;
        self.dispatcher.take_results(&group_id)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let counter = &self.dispatcher.counter;
        Ok(EngineStats {
            elapsed: self.started_at.elapsed(),
            in_flight: counter.in_flight().await?,
            active_requests: counter.limiter().active_requests(),
            counts: counter.counts().await?,
            gated_depth: self.dispatcher.gated.scheduler.depth().await?,
            ungated_depth: self.dispatcher.ungated.scheduler.depth().await?,
            workers: WorkerStats::default(),
        })
    }
}

pub struct Engine<Data, Comp, Ctx>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub ctx: Arc<Ctx>,
    pub computation: Arc<Comp>,
    pub config: EngineConfig,
    dispatcher: Arc<Dispatcher<Data>>,
    hooks: Hooks<Data>,
    stop: Arc<watch::Sender<bool>>,
    started_at: Instant,
}

impl<Data, Comp, Ctx> Engine<Data, Comp, Ctx>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    Comp: Computation<Data, Ctx> + Send + Sync + 'static,
    Ctx: Configurable + Send + Sync + 'static,
{
    /// Build an engine from the `engine` section of the context config.
    pub async fn new(ctx: Ctx, computation: Comp) -> Result<Self, EngineError> {
        let config = EngineConfig::from_config(ctx.config())?;
        Self::with_config(ctx, computation, config).await
    }

    pub async fn with_config(
        ctx: Ctx,
        computation: Comp,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let limiter = ResourceLimiter::from_config(&config)?;
        let backends = Backends::connect(&config.backend).await?;
        let prefix = &config.backend.key_prefix;
        let dispatcher = Dispatcher::new(
            backends
                .scheduler(&config, &format!("{prefix}:gated"))
                .await?,
            backends
                .scheduler(&config, &format!("{prefix}:ungated"))
                .await?,
            backends.counter(&config, &format!("{prefix}:counter"), limiter)?,
            config.max_tries,
        );
        Ok(Self::from_parts(
            Arc::new(ctx),
            Arc::new(computation),
            config,
            dispatcher,
        ))
    }
}

impl<Data, Comp, Ctx> Engine<Data, Comp, Ctx>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    Comp: Computation<Data, Ctx> + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    /// Assemble an engine around an existing dispatcher.
    pub fn from_parts(
        ctx: Arc<Ctx>,
        computation: Arc<Comp>,
        config: EngineConfig,
        dispatcher: Dispatcher<Data>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            ctx,
            computation,
            config,
            dispatcher: Arc::new(dispatcher),
            hooks: Hooks::new(),
            stop: Arc::new(stop),
            started_at: Instant::now(),
        }
    }

    pub fn register_hook(&mut self, registration: HookRegistration<Data>) {
        self.hooks.register(registration);
    }

    pub fn with_hook(mut self, registration: HookRegistration<Data>) -> Self {
        self.register_hook(registration);
        self
    }

    pub fn handle(&self) -> EngineHandle<Data> {
        EngineHandle {
            dispatcher: self.dispatcher.clone(),
            stop: self.stop.clone(),
            started_at: self.started_at,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<Data>> {
        &self.dispatcher
    }

    /// Tasks added before `run` wait in their scheduler until workers start.
    pub async fn add_task(&self, task: Task<Data>) -> Result<bool, EngineError> {
        self.dispatcher.add_task(task).await
    }

    pub async fn run(mut self) -> Result<EngineStats, EngineError> {
        let started = Instant::now();
        self.dispatcher.start().await?;
        if self.persistence_enabled() {
            self.restore().await?;
        }
        self.hooks.on_start().await.map_err(EngineError::Hook)?;

        let hooks = Arc::new(std::mem::take(&mut self.hooks));
        let options = WorkerOptions::from_config(&self.config);
        let parts = PoolParts {
            ctx: &self.ctx,
            computation: &self.computation,
            dispatcher: &self.dispatcher,
            hooks: &hooks,
            options: &options,
            stop: &self.stop,
        };
        let (gated_terminate, _) = broadcast::channel::<()>(1);
        let (ungated_terminate, _) = broadcast::channel::<()>(1);
        let gated_workers = spawn_pool(
            &self.dispatcher.gated,
            1..=self.config.request_workers,
            &parts,
            &gated_terminate,
        );
        let ungated_workers = spawn_pool(
            &self.dispatcher.ungated,
            self.config.request_workers + 1
                ..=self.config.request_workers + self.config.workers,
            &parts,
            &ungated_terminate,
        );
        info!(
            "Started {} gated and {} ungated workers",
            self.config.request_workers, self.config.workers
        );

        let handle = EngineHandle {
            dispatcher: self.dispatcher.clone(),
            stop: self.stop.clone(),
            started_at: started,
        };
        let ticker = (!self.config.stats_interval.is_zero())
            .then(|| spawn_stats_ticker(handle.clone(), self.config.stats_interval));

        let mut fatal: Option<EngineError> = None;
        let mut stop_requested = self.stop.subscribe();
        tokio::select! {
            joined = self.dispatcher.counter.join() => match joined {
                Ok(()) => info!("All tasks done"),
                Err(e) => {
                    error!("Counter failed while waiting: {}", e);
                    fatal = Some(e.into());
                }
            },
            _ = async { stop_requested.wait_for(|stopped| *stopped).await.map(|_| ()) } => {
                info!("Stop requested")
            },
            Ok(()) = tokio::signal::ctrl_c() => warn!("Ctrl+C received, shutting down"),
        }

        // Gated work stops first; whatever it held goes back to its queue.
        gated_terminate.send(()).ok();
        let mut totals = WorkerStats::new();
        join_pool(gated_workers, &mut totals, &mut fatal).await;

        if let Err(e) = self.drain_ungated().await {
            fatal.get_or_insert(e);
        }
        ungated_terminate.send(()).ok();
        join_pool(ungated_workers, &mut totals, &mut fatal).await;
        if let Some(ticker) = ticker {
            ticker.abort();
        }
        info!("All workers stopped");

        let mut report = match handle.stats().await {
            Ok(report) => report,
            Err(e) => {
                fatal.get_or_insert(e);
                EngineStats::default()
            }
        };
        report.workers = totals;
        report.log();
        hooks.on_close().await;

        if self.persistence_enabled() {
            if let Err(e) = self.persist().await {
                error!("Failed to save snapshot: {}", e);
                fatal.get_or_insert(e);
            }
        }
        self.dispatcher.close().await?;

        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn persistence_enabled(&self) -> bool {
        self.config.persistence.enabled && !self.config.backend.any_shared()
    }

    /// Let ungated workers finish ready work, bounded by `shutdown_timeout`.
    /// Waiting tasks stay queued.
    async fn drain_ungated(&self) -> Result<(), EngineError> {
        let lane = &self.dispatcher.ungated;
        let deadline = Instant::now().checked_add(self.config.shutdown_timeout);
        let mut quiet = 0;
        while quiet < QUIET_CHECKS {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Shutdown timeout reached with ungated work left");
                break;
            }
            tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
            let (ready, _) = lane.scheduler.depth().await?;
            if ready == 0 && lane.busy() == 0 {
                quiet += 1;
            } else {
                quiet = 0;
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let path = self.config.persistence.snapshot_path();
        let gated = &self.dispatcher.gated.scheduler;
        let ungated = &self.dispatcher.ungated.scheduler;
        let snapshot = EngineSnapshot {
            gated_tasks: gated.queue().drain().await?,
            ungated_tasks: ungated.queue().drain().await?,
            gated_fingerprints: gated.filter().fingerprints().await?,
            ungated_fingerprints: ungated.filter().fingerprints().await?,
            counter: self.dispatcher.counter.snapshot().await?,
        };
        snapshot.save(&path)?;
        info!(
            "Saved {} tasks to {}",
            snapshot.task_count(),
            path.display()
        );
        Ok(())
    }

    /// Tallies are merged into the current counter; in-flight counts are
    /// rebuilt from the restored tasks, on top of tasks added before `run`.
    async fn restore(&self) -> Result<(), EngineError> {
        let path = self.config.persistence.snapshot_path();
        let Some(snapshot) = EngineSnapshot::<Data>::load(&path)? else {
            return Ok(());
        };
        let counter = &self.dispatcher.counter;
        let mut current = counter.snapshot().await?;
        for (family, saved) in snapshot.counter.counts {
            let counts = current.counts.entry(family).or_default();
            counts.success += saved.success;
            counts.failure += saved.failure;
        }
        counter.restore(current).await?;

        let gated = &self.dispatcher.gated.scheduler;
        let ungated = &self.dispatcher.ungated.scheduler;
        gated.filter().restore(snapshot.gated_fingerprints).await?;
        ungated.filter().restore(snapshot.ungated_fingerprints).await?;

        let mut restored = 0;
        for mut task in snapshot.gated_tasks.into_iter().chain(snapshot.ungated_tasks) {
            counter.add(&task.group_id).await?;
            self.dispatcher.put_back(&mut task).await?;
            restored += 1;
        }
        info!("Restored {} tasks from {}", restored, path.display());
        Ok(())
    }
}

impl<Data, Comp, Ctx> Debug for Engine<Data, Comp, Ctx>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

struct PoolParts<'a, Data, Comp, Ctx>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    ctx: &'a Arc<Ctx>,
    computation: &'a Arc<Comp>,
    dispatcher: &'a Arc<Dispatcher<Data>>,
    hooks: &'a Arc<Hooks<Data>>,
    options: &'a WorkerOptions,
    stop: &'a Arc<watch::Sender<bool>>,
}

type WorkerHandle = JoinHandle<Result<WorkerStats, EngineError>>;

fn spawn_pool<Data, Comp, Ctx>(
    lane: &Arc<Lane<Data>>,
    ids: std::ops::RangeInclusive<usize>,
    parts: &PoolParts<'_, Data, Comp, Ctx>,
    terminate: &broadcast::Sender<()>,
) -> Vec<WorkerHandle>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    Comp: Computation<Data, Ctx> + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    ids.map(|i| {
        let worker = Worker::new(
            WorkerId::new(i),
            parts.ctx.clone(),
            parts.computation.clone(),
            parts.dispatcher.clone(),
            lane.clone(),
            parts.hooks.clone(),
            parts.options.clone(),
        );
        tokio::spawn(worker_wrapper(
            worker,
            terminate.subscribe(),
            parts.stop.clone(),
        ))
    })
    .collect()
}

async fn join_pool(
    handles: Vec<WorkerHandle>,
    totals: &mut WorkerStats,
    fatal: &mut Option<EngineError>,
) {
    for handle in handles {
        match handle.await {
            Ok(Ok(stats)) => totals.merge(&stats),
            Ok(Err(e)) => {
                fatal.get_or_insert(e);
            }
            Err(e) => {
                error!("Fatal error in one of the workers: {:?}", e);
                fatal.get_or_insert(EngineError::Worker(e.to_string()));
            }
        }
    }
}

fn spawn_stats_ticker<Data>(handle: EngineHandle<Data>, period: Duration) -> JoinHandle<()>
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match handle.stats().await {
                Ok(stats) => stats.log(),
                Err(e) => warn!("Failed to collect stats: {}", e),
            }
        }
    })
}

/// Connections shared by every backend that lives in Redis.
struct Backends {
    #[cfg(feature = "redis")]
    client: Option<rustis::client::Client>,
}

impl Backends {
    async fn connect(config: &BackendConfig) -> Result<Self, EngineError> {
        #[cfg(feature = "redis")]
        {
            let client = if config.any_shared() {
                Some(rustis::client::Client::connect(config.redis_uri.as_str()).await?)
            } else {
                None
            };
            Ok(Self { client })
        }
        #[cfg(not(feature = "redis"))]
        {
            if config.any_shared() {
                return Err(ConfigError::Invalid(
                    "redis backend selected but sluice was built without the `redis` feature"
                        .to_string(),
                )
                .into());
            }
            Ok(Self {})
        }
    }

    #[cfg(feature = "redis")]
    fn shared(&self) -> Result<&rustis::client::Client, EngineError> {
        self.client
            .as_ref()
            .ok_or_else(|| EngineError::Internal("redis client is not connected".into()))
    }

    async fn scheduler<Data>(
        &self,
        config: &EngineConfig,
        name: &str,
    ) -> Result<Scheduler<Data>, EngineError>
    where
        Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let filter: AbstractDuplicateFilter = match config.backend.dupefilter {
            BackendKind::Local => Arc::new(InMemoryDuplicateFilter::new()),
            #[cfg(feature = "redis")]
            BackendKind::Redis => Arc::new(sluice_queue::RedisDuplicateFilter::new(
                self.shared()?.clone(),
                name,
            )),
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => return Err(self.unsupported()),
        };
        let queue: AbstractTaskQueue<Data> = match config.backend.queue {
            BackendKind::Local => {
                Arc::new(InMemoryTaskQueue::<Data>::with_poll_interval(
                    config.poll_interval,
                ))
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => {
                let queue: sluice_queue::RedisTaskQueue<Data> =
                    sluice_queue::RedisTaskQueue::new(self.shared()?.clone(), name)
                        .await?;
                Arc::new(queue.with_poll_interval(config.poll_interval))
            }
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => return Err(self.unsupported()),
        };
        Ok(Scheduler::new(name, filter, queue))
    }

    fn counter(
        &self,
        config: &EngineConfig,
        #[cfg_attr(not(feature = "redis"), allow(unused_variables))] name: &str,
        limiter: ResourceLimiter,
    ) -> Result<AbstractCounter, EngineError> {
        match config.backend.counter {
            BackendKind::Local => {
                Ok(Arc::new(LocalCounter::new(limiter, config.lock_always)))
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => Ok(Arc::new(crate::manager::RedisCounter::new(
                self.shared()?.clone(),
                name,
                limiter,
                config.lock_always,
                config.join_poll_interval,
            ))),
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => Err(self.unsupported()),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn unsupported(&self) -> EngineError {
        ConfigError::Invalid("sluice was built without the `redis` feature".to_string())
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_the_source() {
        let err = EngineError::from(CounterError::Underflow {
            group: "g".into(),
        });
        assert_eq!(
            err.to_string(),
            "Counter error: task done() called more times than add() for group g"
        );
        let err = EngineError::Hook(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "Hook error: outer: inner");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn shared_backend_needs_the_redis_feature() {
        let mut backend = BackendConfig::default();
        backend.queue = BackendKind::Redis;
        assert!(matches!(
            Backends::connect(&backend).await,
            Err(EngineError::Config(ConfigError::Invalid(_)))
        ));
    }
}
