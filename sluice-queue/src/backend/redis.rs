//! Redis-backed delay/priority queue.
//!
//! Keys:
//! - `{name}:waiting` sorted set, score is `ready_at` in epoch seconds;
//! - `{name}:ready` sorted set, score is `-priority`;
//! - `{name}:tasks` hash from entry id to the encoded task.
//!
//! Entry ids are `{ready_at}:{pushed_at}:{priority}:{uuid}` with both times
//! in zero-padded microseconds, so members sharing a score pop in readiness
//! then push order, and a transfer reads the priority off the id.
//!
//! Transfer and pop each run as one Lua script, so an interrupted caller
//! never leaves a body without its index entry.
use async_trait::async_trait;
use rustis::client::{BatchPreparedCommand, Client};
use rustis::commands::{
    CallBuilder, GenericCommands, HashCommands, ScriptingCommands,
    SortedSetCommands, ZAddOptions, ZRangeOptions,
};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::codec::{JsonCodec, TaskCodec};
use crate::queue::DEFAULT_POLL_INTERVAL;
use crate::task::{epoch_micros, epoch_secs};
use crate::{Task, TaskQueue, TaskQueueError};

const POP_SCRIPT: &str = include_str!("lua/pop.lua");
const TRANSFER_SCRIPT: &str = include_str!("lua/transfer.lua");

pub struct RedisTaskQueue<D, C = JsonCodec>
where
    C: TaskCodec,
{
    pub client: Client,
    pub waiting_key: String,
    pub ready_key: String,
    pub tasks_key: String,
    poll_interval: Duration,
    _marker: PhantomData<(D, C)>,
}

impl<D, C> RedisTaskQueue<D, C>
where
    D: Send + Sync + 'static,
    C: TaskCodec,
{
    pub async fn new(
        client: Client,
        queue_name: &str,
    ) -> Result<Self, TaskQueueError> {
        Ok(Self {
            client,
            waiting_key: format!("{}:{}", queue_name, "waiting"),
            ready_key: format!("{}:{}", queue_name, "ready"),
            tasks_key: format!("{}:{}", queue_name, "tasks"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            _marker: PhantomData,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn entry_id<T: Clone>(task: &Task<T>) -> String {
        format!(
            "{:020}:{:020}:{}:{}",
            epoch_micros(task.ready_at),
            epoch_micros(SystemTime::now()),
            task.priority,
            Uuid::new_v4().simple()
        )
    }

    /// Move every elapsed member of `waiting` into `ready`, scored by the
    /// priority carried in its entry id.
    async fn transfer_elapsed(&self) -> Result<usize, TaskQueueError> {
        let now = epoch_secs(SystemTime::now()).to_string();
        let moved: usize = self
            .client
            .eval(
                CallBuilder::script(TRANSFER_SCRIPT)
                    .keys([self.waiting_key.as_str(), self.ready_key.as_str()])
                    .args(now),
            )
            .await?;
        Ok(moved)
    }
}

#[async_trait]
impl<D, C> TaskQueue<D> for RedisTaskQueue<D, C>
where
    D: std::fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    C: TaskCodec,
{
    async fn push(&self, task: &Task<D>) -> Result<(), TaskQueueError> {
        let data = C::encode(task)?;
        let entry_id = Self::entry_id(task);

        let mut transaction = self.client.create_transaction();
        transaction
            .hset(&self.tasks_key, [(entry_id.as_str(), data.as_str())])
            .forget();
        transaction
            .zadd(
                &self.waiting_key,
                [(epoch_secs(task.ready_at), entry_id.as_str())],
                ZAddOptions::default(),
            )
            .forget();
        transaction.execute::<()>().await?;
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<Task<D>>, TaskQueueError> {
        self.transfer_elapsed().await?;

        let data: Option<String> = self
            .client
            .eval(
                CallBuilder::script(POP_SCRIPT)
                    .keys([self.ready_key.as_str(), self.tasks_key.as_str()]),
            )
            .await?;
        data.map(|data| C::decode(&data)).transpose()
    }

    async fn transfer(&self) -> Result<usize, TaskQueueError> {
        self.transfer_elapsed().await
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        Ok(self.client.hlen(&self.tasks_key).await?)
    }

    async fn ready_len(&self) -> Result<usize, TaskQueueError> {
        self.transfer_elapsed().await?;
        Ok(self.client.zcard(&self.ready_key).await?)
    }

    async fn waiting_len(&self) -> Result<usize, TaskQueueError> {
        self.transfer_elapsed().await?;
        Ok(self.client.zcard(&self.waiting_key).await?)
    }

    async fn clear(&self) -> Result<(), TaskQueueError> {
        self.client
            .del([&self.waiting_key, &self.ready_key, &self.tasks_key])
            .await?;
        Ok(())
    }

    async fn drain(&self) -> Result<Vec<Task<D>>, TaskQueueError> {
        self.transfer_elapsed().await?;

        let ready: Vec<String> = self
            .client
            .zrange(&self.ready_key, 0, -1, ZRangeOptions::default())
            .await?;
        let waiting: Vec<String> = self
            .client
            .zrange(&self.waiting_key, 0, -1, ZRangeOptions::default())
            .await?;
        let mut bodies: HashMap<String, String> =
            self.client.hgetall(&self.tasks_key).await?;
        self.clear().await?;

        let mut tasks = Vec::with_capacity(bodies.len());
        for entry_id in ready.iter().chain(waiting.iter()) {
            if let Some(data) = bodies.remove(entry_id) {
                tasks.push(C::decode(&data)?);
            }
        }
        // Bodies no sorted set points at, e.g. left by a consumer that died
        // mid-pop.
        let mut orphans: Vec<(String, String)> = bodies.into_iter().collect();
        orphans.sort();
        for (_, data) in orphans {
            tasks.push(C::decode(&data)?);
        }
        Ok(tasks)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl<D, C> std::fmt::Debug for RedisTaskQueue<D, C>
where
    C: TaskCodec,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("waiting_key", &self.waiting_key)
            .field("ready_key", &self.ready_key)
            .field("tasks_key", &self.tasks_key)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
