//! Scheduler composes a duplicate filter with a delay/priority queue.
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::filter::{AbstractDuplicateFilter, InMemoryDuplicateFilter};
use crate::queue::AbstractTaskQueue;
use crate::{InMemoryTaskQueue, Task, TaskQueueError};

pub struct Scheduler<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub name: String,
    filter: AbstractDuplicateFilter,
    queue: AbstractTaskQueue<D>,
}

impl<D> Scheduler<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        filter: AbstractDuplicateFilter,
        queue: AbstractTaskQueue<D>,
    ) -> Self {
        Self {
            name: name.into(),
            filter,
            queue,
        }
    }

    /// Process-local scheduler: hash-set filter and in-memory queue.
    pub fn in_memory(name: impl Into<String>, poll_interval: Duration) -> Self {
        Self::new(
            name,
            Arc::new(InMemoryDuplicateFilter::new()),
            Arc::new(InMemoryTaskQueue::<D>::with_poll_interval(poll_interval)),
        )
    }

    pub async fn start(&self) -> Result<(), TaskQueueError> {
        self.filter.start().await?;
        self.queue.start().await
    }

    /// Admit `task`. Tasks without a dedup key, or any task when
    /// `dont_filter` is set, are pushed unconditionally. Otherwise the
    /// first presentation of a fingerprint is pushed and later ones are
    /// rejected with `false`. A fingerprint whose push failed is released
    /// again.
    pub async fn produce(
        &self,
        task: &Task<D>,
        dont_filter: bool,
    ) -> Result<bool, TaskQueueError> {
        let mut recorded = None;
        if !dont_filter {
            if let Some(key) = task.dedup_key.as_deref() {
                if self.filter.seen(key).await? {
                    tracing::trace!("[{}] Filtered duplicate {}", self.name, task);
                    return Ok(false);
                }
                recorded = Some(key);
            }
        }
        if let Err(e) = self.queue.push(task).await {
            if let Some(key) = recorded {
                if let Err(forget_err) = self.filter.forget(key).await {
                    tracing::warn!(
                        "[{}] Failed to release fingerprint of {}: {}",
                        self.name,
                        task,
                        forget_err
                    );
                }
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Wait for the next ready task.
    pub async fn consume(&self) -> Result<Task<D>, TaskQueueError> {
        self.queue.pop().await
    }

    pub async fn try_consume(&self) -> Result<Option<Task<D>>, TaskQueueError> {
        self.queue.try_pop().await
    }

    pub async fn len(&self) -> Result<usize, TaskQueueError> {
        self.queue.len().await
    }

    pub async fn is_empty(&self) -> Result<bool, TaskQueueError> {
        self.queue.is_empty().await
    }

    /// `(ready, waiting)` depth of the queue.
    pub async fn depth(&self) -> Result<(usize, usize), TaskQueueError> {
        let ready = self.queue.ready_len().await?;
        let waiting = self.queue.waiting_len().await?;
        Ok((ready, waiting))
    }

    pub async fn clear(&self) -> Result<(), TaskQueueError> {
        self.filter.clear().await?;
        self.queue.clear().await
    }

    pub async fn close(&self) -> Result<(), TaskQueueError> {
        self.queue.close().await?;
        self.filter.close().await
    }

    pub fn filter(&self) -> &AbstractDuplicateFilter {
        &self.filter
    }

    pub fn queue(&self) -> &AbstractTaskQueue<D> {
        &self.queue
    }
}

impl<D> Debug for Scheduler<D>
where
    D: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("name", &self.name).finish()
    }
}
