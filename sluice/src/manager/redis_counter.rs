//! Counter shared between processes through Redis.
//!
//! - `{prefix}:in_flight` integer;
//! - `{prefix}:groups` sorted set, group id scored by its in-flight count;
//! - `{prefix}:success` / `{prefix}:failure` sorted sets, family scored by
//!   its tally.
//!
//! Joins poll every `join_poll_interval` instead of being notified. The
//! resource limiter stays process-local.
use async_trait::async_trait;
use rustis::client::{BatchPreparedCommand, Client};
use rustis::commands::{
    GenericCommands, SortedSetCommands, StringCommands, ZAddOptions,
    ZRangeOptions,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::manager::{
    Counter, CounterError, CounterSnapshot, FamilyCounts, ResourceLimiter, Tally,
};

pub struct RedisCounter {
    pub client: Client,
    pub in_flight_key: String,
    pub groups_key: String,
    pub success_key: String,
    pub failure_key: String,
    join_poll_interval: Duration,
    lock_always: bool,
    unlocked: AtomicBool,
    limiter: ResourceLimiter,
}

fn backend(e: rustis::Error) -> CounterError {
    CounterError::Backend(e.to_string())
}

impl RedisCounter {
    pub fn new(
        client: Client,
        prefix: &str,
        limiter: ResourceLimiter,
        lock_always: bool,
        join_poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            in_flight_key: format!("{}:{}", prefix, "in_flight"),
            groups_key: format!("{}:{}", prefix, "groups"),
            success_key: format!("{}:{}", prefix, "success"),
            failure_key: format!("{}:{}", prefix, "failure"),
            join_poll_interval,
            lock_always,
            unlocked: AtomicBool::new(false),
            limiter,
        }
    }

    /// Remove every key the counter owns.
    pub async fn clear(&self) -> Result<(), CounterError> {
        self.client
            .del([
                &self.in_flight_key,
                &self.groups_key,
                &self.success_key,
                &self.failure_key,
            ])
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn scores(&self, key: &str) -> Result<Vec<(String, f64)>, CounterError> {
        self.client
            .zrange_with_scores(key, 0, -1, ZRangeOptions::default())
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl Counter for RedisCounter {
    async fn add(&self, group: &str) -> Result<(), CounterError> {
        let mut transaction = self.client.create_transaction();
        transaction.zincrby(&self.groups_key, 1.0, group).forget();
        transaction.incr(&self.in_flight_key).forget();
        transaction.execute::<()>().await.map_err(backend)?;
        Ok(())
    }

    async fn done(
        &self,
        family: &str,
        group: &str,
        tally: Tally,
    ) -> Result<(), CounterError> {
        let mut transaction = self.client.create_transaction();
        transaction.zincrby(&self.groups_key, -1.0, group).queue();
        transaction.decr(&self.in_flight_key).queue();
        // Drop groups that reached zero; a concurrent add has already
        // moved its group above zero and is left alone.
        transaction
            .zremrangebyscore(&self.groups_key, 0, 0)
            .forget();
        let (group_left, in_flight): (f64, i64) =
            transaction.execute().await.map_err(backend)?;

        if group_left < 0.0 || in_flight < 0 {
            return Err(CounterError::Underflow {
                group: group.to_string(),
            });
        }

        let tally_key = match tally {
            Tally::Success => &self.success_key,
            Tally::Failure => &self.failure_key,
            Tally::Transient => return Ok(()),
        };
        self.client
            .zincrby(tally_key, 1.0, family)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn join(&self) -> Result<(), CounterError> {
        loop {
            if self.unlocked.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !self.lock_always && self.in_flight().await? == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.join_poll_interval).await;
        }
    }

    async fn join_group(&self, group: &str) -> Result<(), CounterError> {
        while self.group_in_flight(group).await? > 0 {
            tokio::time::sleep(self.join_poll_interval).await;
        }
        Ok(())
    }

    async fn in_flight(&self) -> Result<u64, CounterError> {
        let value: Option<i64> =
            self.client.get(&self.in_flight_key).await.map_err(backend)?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn group_in_flight(&self, group: &str) -> Result<u64, CounterError> {
        let score: Option<f64> = self
            .client
            .zscore(&self.groups_key, group)
            .await
            .map_err(backend)?;
        Ok(score.unwrap_or(0.0).max(0.0) as u64)
    }

    async fn counts(&self) -> Result<BTreeMap<String, FamilyCounts>, CounterError> {
        let mut counts: BTreeMap<String, FamilyCounts> = BTreeMap::new();
        for (family, score) in self.scores(&self.success_key).await? {
            counts.entry(family).or_default().success = score as u64;
        }
        for (family, score) in self.scores(&self.failure_key).await? {
            counts.entry(family).or_default().failure = score as u64;
        }
        Ok(counts)
    }

    async fn snapshot(&self) -> Result<CounterSnapshot, CounterError> {
        let groups = self
            .scores(&self.groups_key)
            .await?
            .into_iter()
            .filter(|(_, n)| *n > 0.0)
            .map(|(g, n)| (g, n as u64))
            .collect();
        Ok(CounterSnapshot {
            in_flight: self.in_flight().await?,
            groups,
            counts: self.counts().await?,
        })
    }

    async fn restore(&self, snapshot: CounterSnapshot) -> Result<(), CounterError> {
        self.clear().await?;
        self.client
            .set(&self.in_flight_key, snapshot.in_flight)
            .await
            .map_err(backend)?;

        let groups: Vec<(f64, String)> = snapshot
            .groups
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(g, n)| (n as f64, g))
            .collect();
        let mut success = Vec::new();
        let mut failure = Vec::new();
        for (family, c) in snapshot.counts {
            if c.success > 0 {
                success.push((c.success as f64, family.clone()));
            }
            if c.failure > 0 {
                failure.push((c.failure as f64, family));
            }
        }
        for (key, items) in [
            (&self.groups_key, groups),
            (&self.success_key, success),
            (&self.failure_key, failure),
        ] {
            if !items.is_empty() {
                self.client
                    .zadd(key, items, ZAddOptions::default())
                    .await
                    .map_err(backend)?;
            }
        }
        Ok(())
    }

    fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
    }

    fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }
}

impl std::fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounter")
            .field("in_flight_key", &self.in_flight_key)
            .field("groups_key", &self.groups_key)
            .field("lock_always", &self.lock_always)
            .finish()
    }
}
