//! Task model, duplicate filters, delay/priority queues and the scheduler
//! that composes them.
pub mod backend;
pub mod codec;
pub mod filter;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use crate::backend::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use crate::backend::{RedisDuplicateFilter, RedisTaskQueue};
pub use crate::codec::{JsonCodec, TaskCodec};
pub use crate::filter::{
    AbstractDuplicateFilter, DuplicateFilter, InMemoryDuplicateFilter,
};
pub use crate::queue::{AbstractTaskQueue, TaskQueue};
pub use crate::scheduler::Scheduler;
pub use crate::task::{
    DEFAULT_FAMILY, DEFAULT_GROUP, MAX_DELAY, Task, TaskId, TaskStatus, deadline,
    fingerprint,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    RedisError(#[from] rustis::Error),
}
