//! # sluice
//!
//! `sluice` runs user-defined async computations over a stream of tasks
//! that the computations themselves keep producing. It takes care of the
//! plumbing between them:
//!
//! - **Deduplication**: tasks with a dedup key are accepted once.
//! - **Delayed and prioritised delivery**: a task waits until its
//!   `ready_at`, then runs ahead of every ready task with lower priority.
//! - **Per-resource admission**: tasks with a resource key run in a
//!   separate gated lane, capped per key and per configured pattern, with
//!   jittered pacing.
//! - **Retries**: failures are retried until the task's budget runs out,
//!   then logged and dropped. Skips and reschedules never cost a try.
//! - **Cohorts**: `EngineHandle::submit` waits for a group of tasks and
//!   everything they spawned, then returns the records they emitted.
//! - **Shared state**: queues, filters and the counter can live in Redis
//!   (feature `redis`) so several processes work on one crawl.
//! - **Snapshots**: a local engine saves its queues on shutdown and picks
//!   them up on the next start.
//!
//! ## Modules
//!
//! - `config`: YAML configuration and the typed `EngineConfig`.
//! - `queue`: tasks, duplicate filters, delay/priority queues, schedulers.
//! - `manager`: counter, limiter, workers and the engine.
//! - `logging`: tracing subscriber setup.
pub mod logging;
pub mod manager;
pub mod prelude;
pub use sluice_config as config;
pub use sluice_queue as queue;
#[cfg(feature = "redis")]
pub use rustis;
// re-export
pub use async_trait;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
pub use tracing_subscriber;
pub use uuid;
