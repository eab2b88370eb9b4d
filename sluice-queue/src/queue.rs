//! Delay/priority queue abstraction.
//!
//! Every backend keeps two stores: `waiting`, ordered by `ready_at`, and
//! `ready`, ordered by priority (higher first) and then by `ready_at`
//! (earlier first). `push` always lands in `waiting`; a transfer step moves
//! every task whose `ready_at` has elapsed into `ready` before pops and
//! length queries.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, sync::Arc, time::Duration};

use super::TaskQueueError;
use crate::task::Task;

/// How long a blocked `pop` sleeps between transfer attempts by default.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait TaskQueue<Data>: Send + Sync
where
    Data: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn start(&self) -> Result<(), TaskQueueError> {
        Ok(())
    }

    async fn push(&self, task: &Task<Data>) -> Result<(), TaskQueueError>;

    /// Non-blocking pop: transfers, then returns the best ready task if any.
    async fn try_pop(&self) -> Result<Option<Task<Data>>, TaskQueueError>;

    /// Move every elapsed task from `waiting` to `ready`. Returns the number
    /// of tasks moved.
    async fn transfer(&self) -> Result<usize, TaskQueueError>;

    /// Suspend until a task is ready and hand it to exactly one caller.
    async fn pop(&self) -> Result<Task<Data>, TaskQueueError> {
        loop {
            if let Some(task) = self.try_pop().await? {
                return Ok(task);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Total number of queued tasks, waiting and ready.
    async fn len(&self) -> Result<usize, TaskQueueError>;

    async fn ready_len(&self) -> Result<usize, TaskQueueError>;

    async fn waiting_len(&self) -> Result<usize, TaskQueueError>;

    async fn is_empty(&self) -> Result<bool, TaskQueueError> {
        Ok(self.len().await? == 0)
    }

    async fn clear(&self) -> Result<(), TaskQueueError>;

    /// Remove and return every queued task, ready ones first.
    async fn drain(&self) -> Result<Vec<Task<Data>>, TaskQueueError>;

    async fn close(&self) -> Result<(), TaskQueueError> {
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }
}

pub type AbstractTaskQueue<D> = Arc<dyn TaskQueue<D> + Send + Sync>;
