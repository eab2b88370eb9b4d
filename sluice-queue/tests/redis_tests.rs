#![cfg(feature = "redis")]

#[cfg(test)]
mod tests {
    use dotenvy::dotenv;
    use rustis::client::Client;
    use rustis::commands::{HashCommands, SortedSetCommands, ZAddOptions};
    use serde::{Deserialize, Serialize};
    use serial_test::serial;
    use sluice_queue::{
        DuplicateFilter, RedisDuplicateFilter, RedisTaskQueue, Scheduler, Task,
        TaskQueue,
    };
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        value: u32,
    }

    async fn get_redis_connection() -> Client {
        dotenv().ok();
        let uri = std::env::var("REDIS_URI").expect("Set REDIS_URI env variable");
        Client::connect(uri)
            .await
            .expect("Error while establishing redis connection")
    }

    async fn setup_queue(name: &str) -> RedisTaskQueue<TestData> {
        let redis = get_redis_connection().await;
        let queue = RedisTaskQueue::new(redis, name)
            .await
            .expect("Failed to create RedisTaskQueue")
            .with_poll_interval(Duration::from_millis(100));
        queue.clear().await.expect("Failed to clean up Redis keys");
        queue
    }

    async fn setup_filter(name: &str) -> RedisDuplicateFilter {
        let filter = RedisDuplicateFilter::new(get_redis_connection().await, name);
        filter.clear().await.expect("Failed to clean up Redis keys");
        filter
    }

    #[tokio::test]
    #[serial]
    async fn test_push_and_pop() {
        let queue = setup_queue("sluice-test-push-pop").await;
        let task = Task::new(TestData { value: 42 });

        queue.push(&task).await.expect("Failed to push task");
        assert_eq!(queue.len().await.unwrap(), 1);

        let popped = queue.pop().await.expect("Failed to pop task");
        assert_eq!(popped.payload, task.payload);
        assert_eq!(popped.task_id, task.task_id);
        assert!(queue.is_empty().await.unwrap());

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_priority_order_with_fifo_ties() {
        let queue = setup_queue("sluice-test-priority").await;
        for (value, priority) in [(1, 3), (2, 1), (3, 3), (4, 2)] {
            let task = Task::new(TestData { value }).with_priority(priority);
            queue.push(&task).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(task) = queue.try_pop().await.unwrap() {
            order.push(task.payload.value);
        }
        assert_eq!(order, vec![1, 3, 4, 2]);

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_negative_priorities_sort_last() {
        let queue = setup_queue("sluice-test-negative-priority").await;
        for (value, priority) in [(1, -2), (2, 0), (3, -1), (4, 5)] {
            let task = Task::new(TestData { value }).with_priority(priority);
            queue.push(&task).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(task) = queue.try_pop().await.unwrap() {
            order.push(task.payload.value);
        }
        assert_eq!(order, vec![4, 2, 3, 1]);

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_pop_removes_entry_and_body_together() {
        let queue = setup_queue("sluice-test-pop-atomic").await;
        queue.push(&Task::new(TestData { value: 1 })).await.unwrap();
        // An index entry whose body is gone is skipped.
        queue
            .client
            .zadd(
                &queue.ready_key,
                [(-10.0, "00000000000000000000:00000000000000000000:10:gone")],
                ZAddOptions::default(),
            )
            .await
            .unwrap();

        let popped = queue.try_pop().await.unwrap().unwrap();
        assert_eq!(popped.payload.value, 1);
        assert!(queue.try_pop().await.unwrap().is_none());
        let bodies: usize = queue.client.hlen(&queue.tasks_key).await.unwrap();
        let ready: usize = queue.client.zcard(&queue.ready_key).await.unwrap();
        let waiting: usize = queue.client.zcard(&queue.waiting_key).await.unwrap();
        assert_eq!((bodies, ready, waiting), (0, 0, 0));

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_delayed_task_waits() {
        let queue = setup_queue("sluice-test-delay").await;
        let task = Task::new(TestData { value: 7 })
            .ready_after(Duration::from_millis(600));
        queue.push(&task).await.unwrap();

        assert!(queue.try_pop().await.unwrap().is_none());
        assert_eq!(queue.waiting_len().await.unwrap(), 1);

        let started = Instant::now();
        let popped = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .expect("pop should return after the delay")
            .unwrap();
        assert_eq!(popped.payload.value, 7);
        assert!(started.elapsed() >= Duration::from_millis(400));

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_drain_returns_ready_then_waiting() {
        let queue = setup_queue("sluice-test-drain").await;
        queue
            .push(
                &Task::new(TestData { value: 1 })
                    .ready_after(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        queue.push(&Task::new(TestData { value: 2 })).await.unwrap();

        let drained = queue.drain().await.unwrap();
        let values: Vec<u32> = drained.iter().map(|t| t.payload.value).collect();
        assert_eq!(values, vec![2, 1]);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    async fn test_concurrent_consumers() {
        let queue = Arc::new(setup_queue("sluice-test-concurrent").await);
        for value in 0..50 {
            queue.push(&Task::new(TestData { value })).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(task) = queue.try_pop().await.unwrap() {
                    got.push(task.payload.value);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (0..50).collect::<Vec<_>>());

        queue.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_filter_exactly_once() {
        let filter = setup_filter("sluice-test-filter").await;
        assert!(!filter.seen("fp-1").await.unwrap());
        assert!(filter.seen("fp-1").await.unwrap());
        assert!(filter.seen("fp-1").await.unwrap());
        assert_eq!(filter.len().await.unwrap(), 1);

        filter.forget("fp-1").await.unwrap();
        assert!(!filter.seen("fp-1").await.unwrap());

        filter.restore(vec!["fp-2".into(), "fp-3".into()]).await.unwrap();
        assert_eq!(
            filter.fingerprints().await.unwrap(),
            vec!["fp-1", "fp-2", "fp-3"]
        );

        filter.clear().await.unwrap();
        assert_eq!(filter.len().await.unwrap(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_shared_filter_across_clients() {
        let first = setup_filter("sluice-test-filter-shared").await;
        let second = RedisDuplicateFilter::new(
            get_redis_connection().await,
            "sluice-test-filter-shared",
        );
        assert!(!first.seen("same").await.unwrap());
        assert!(second.seen("same").await.unwrap());
        first.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_scheduler_over_redis() {
        let queue = setup_queue("sluice-test-scheduler").await;
        let filter = setup_filter("sluice-test-scheduler").await;
        let scheduler = Scheduler::new("redis", Arc::new(filter), Arc::new(queue));

        let task = Task::new(TestData { value: 1 }).with_dedup_key("one");
        assert!(scheduler.produce(&task, false).await.unwrap());
        assert!(!scheduler.produce(&task, false).await.unwrap());
        assert!(scheduler.produce(&task, true).await.unwrap());
        assert_eq!(scheduler.len().await.unwrap(), 2);

        scheduler.clear().await.unwrap();
    }
}
