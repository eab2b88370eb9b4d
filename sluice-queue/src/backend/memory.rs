//! In-memory implementation of the `TaskQueue` trait: a min-heap of waiting
//! tasks keyed by readiness time and a max-heap of ready tasks keyed by
//! priority. Blocked consumers wake on push, when the earliest waiting task
//! becomes ready, or after `poll_interval` at the latest.
use crate::queue::DEFAULT_POLL_INTERVAL;
use crate::task::Task;
use crate::{TaskQueue, TaskQueueError};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;

struct Entry<D: Clone> {
    seq: u64,
    task: Task<D>,
}

/// Heap wrapper ordering by earliest `ready_at`, then insertion order.
struct Waiting<D: Clone>(Entry<D>);

/// Heap wrapper ordering by highest priority, then earliest `ready_at`,
/// then insertion order.
struct Ready<D: Clone>(Entry<D>);

impl<D: Clone> Ord for Waiting<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .task
            .ready_at
            .cmp(&self.0.task.ready_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl<D: Clone> PartialOrd for Waiting<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: Clone> PartialEq for Waiting<D> {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl<D: Clone> Eq for Waiting<D> {}

impl<D: Clone> Ord for Ready<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .task
            .priority
            .cmp(&other.0.task.priority)
            .then_with(|| other.0.task.ready_at.cmp(&self.0.task.ready_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl<D: Clone> PartialOrd for Ready<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: Clone> PartialEq for Ready<D> {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl<D: Clone> Eq for Ready<D> {}

struct QueueState<D: Clone> {
    waiting: BinaryHeap<Waiting<D>>,
    ready: BinaryHeap<Ready<D>>,
    next_seq: u64,
}

impl<D: Clone> QueueState<D> {
    fn new() -> Self {
        Self {
            waiting: BinaryHeap::new(),
            ready: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn transfer(&mut self, now: SystemTime) -> usize {
        let mut moved = 0;
        while let Some(top) = self.waiting.peek() {
            if !top.0.task.is_ready(now) {
                break;
            }
            if let Some(Waiting(entry)) = self.waiting.pop() {
                self.ready.push(Ready(entry));
                moved += 1;
            }
        }
        moved
    }

    /// Time until the earliest waiting task becomes ready.
    fn next_ready_in(&self, now: SystemTime) -> Option<Duration> {
        self.waiting.peek().map(|top| {
            top.0
                .task
                .ready_at
                .duration_since(now)
                .unwrap_or(Duration::ZERO)
        })
    }
}

pub struct InMemoryTaskQueue<D: Clone> {
    state: Mutex<QueueState<D>>,
    notify: Notify,
    poll_interval: Duration,
}

impl<D: Clone> InMemoryTaskQueue<D> {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState<D>>, TaskQueueError> {
        self.state
            .lock()
            .map_err(|e| TaskQueueError::QueueError(e.to_string()))
    }
}

impl<D: Clone> Default for InMemoryTaskQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D> TaskQueue<D> for InMemoryTaskQueue<D>
where
    D: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn push(&self, task: &Task<D>) -> Result<(), TaskQueueError> {
        {
            let mut state = self.lock()?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(Waiting(Entry {
                seq,
                task: task.clone(),
            }));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<Task<D>>, TaskQueueError> {
        let mut state = self.lock()?;
        state.transfer(SystemTime::now());
        Ok(state.ready.pop().map(|Ready(entry)| entry.task))
    }

    async fn transfer(&self) -> Result<usize, TaskQueueError> {
        Ok(self.lock()?.transfer(SystemTime::now()))
    }

    async fn pop(&self) -> Result<Task<D>, TaskQueueError> {
        loop {
            // Registered before the check so a push in between still wakes us.
            let notified = self.notify.notified();
            let next_ready_in = {
                let mut state = self.lock()?;
                let now = SystemTime::now();
                state.transfer(now);
                if let Some(Ready(entry)) = state.ready.pop() {
                    return Ok(entry.task);
                }
                state.next_ready_in(now)
            };
            let nap = next_ready_in
                .map_or(self.poll_interval, |d| d.min(self.poll_interval));
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(nap) => {},
            }
        }
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        let state = self.lock()?;
        Ok(state.waiting.len() + state.ready.len())
    }

    async fn ready_len(&self) -> Result<usize, TaskQueueError> {
        let mut state = self.lock()?;
        state.transfer(SystemTime::now());
        Ok(state.ready.len())
    }

    async fn waiting_len(&self) -> Result<usize, TaskQueueError> {
        let mut state = self.lock()?;
        state.transfer(SystemTime::now());
        Ok(state.waiting.len())
    }

    async fn clear(&self) -> Result<(), TaskQueueError> {
        let mut state = self.lock()?;
        state.waiting.clear();
        state.ready.clear();
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<Task<D>>, TaskQueueError> {
        let mut state = self.lock()?;
        let mut tasks = Vec::with_capacity(state.waiting.len() + state.ready.len());
        while let Some(Ready(entry)) = state.ready.pop() {
            tasks.push(entry.task);
        }
        while let Some(Waiting(entry)) = state.waiting.pop() {
            tasks.push(entry.task);
        }
        Ok(tasks)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl<D: Clone> std::fmt::Debug for InMemoryTaskQueue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryTaskQueue");
        match self.state.lock() {
            Ok(state) => debug
                .field("waiting", &state.waiting.len())
                .field("ready", &state.ready.len()),
            Err(_) => debug.field("state", &"<poisoned>"),
        };
        debug.field("poll_interval", &self.poll_interval).finish()
    }
}
