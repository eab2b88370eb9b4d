#![cfg(feature = "redis")]

#[cfg(test)]
mod tests {
    use dotenvy::dotenv;
    use rustis::client::Client;
    use serial_test::serial;
    use sluice::manager::{
        Counter, CounterError, CounterSnapshot, FamilyCounts, RedisCounter,
        ResourceLimiter, Tally,
    };
    use std::sync::Arc;
    use std::time::Duration;

    async fn get_redis_connection() -> Client {
        dotenv().ok();
        let uri = std::env::var("REDIS_URI").expect("Set REDIS_URI env variable");
        Client::connect(uri)
            .await
            .expect("Error while establishing redis connection")
    }

    async fn setup_counter(prefix: &str, lock_always: bool) -> RedisCounter {
        let counter = RedisCounter::new(
            get_redis_connection().await,
            prefix,
            ResourceLimiter::unlimited(),
            lock_always,
            Duration::from_millis(20),
        );
        counter.clear().await.expect("Failed to clean up Redis keys");
        counter
    }

    #[tokio::test]
    #[serial]
    async fn test_add_and_done_track_groups_and_tallies() {
        let counter = setup_counter("sluice-test-counter-tally", false).await;
        counter.add("g1").await.unwrap();
        counter.add("g1").await.unwrap();
        counter.add("g2").await.unwrap();
        assert_eq!(counter.in_flight().await.unwrap(), 3);
        assert_eq!(counter.group_in_flight("g1").await.unwrap(), 2);

        counter.done("Page", "g1", Tally::Success).await.unwrap();
        counter.done("Page", "g1", Tally::Failure).await.unwrap();
        counter.done("Item", "g2", Tally::Transient).await.unwrap();

        assert_eq!(counter.in_flight().await.unwrap(), 0);
        assert_eq!(counter.group_in_flight("g1").await.unwrap(), 0);
        let counts = counter.counts().await.unwrap();
        assert_eq!(
            counts["Page"],
            FamilyCounts {
                success: 1,
                failure: 1
            }
        );
        assert!(!counts.contains_key("Item"));

        counter.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_done_without_add_is_an_underflow() {
        let counter = setup_counter("sluice-test-counter-underflow", false).await;
        let err = counter.done("Page", "g", Tally::Success).await.unwrap_err();
        assert!(matches!(err, CounterError::Underflow { .. }));
        counter.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_join_group_polls_until_drained() {
        let counter = Arc::new(setup_counter("sluice-test-counter-join", false).await);
        counter.add("slow").await.unwrap();
        counter.add("quick").await.unwrap();

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.join_group("quick").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        counter.done("Task", "quick", Tally::Success).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("join_group should return")
            .unwrap()
            .unwrap();
        assert_eq!(counter.in_flight().await.unwrap(), 1);

        counter.clear().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_always_locked_join_waits_for_unlock() {
        let counter = Arc::new(setup_counter("sluice-test-counter-locked", true).await);
        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.join().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        assert!(counter.is_idle().await.unwrap());

        counter.unlock();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("join should return after unlock")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_snapshot_restores_into_fresh_counter() {
        let counter = setup_counter("sluice-test-counter-snapshot", false).await;
        counter.add("g").await.unwrap();
        counter.add("g").await.unwrap();
        counter.done("Page", "g", Tally::Success).await.unwrap();
        let snapshot = counter.snapshot().await.unwrap();
        assert_eq!(snapshot.in_flight, 1);

        counter.clear().await.unwrap();
        assert_eq!(counter.snapshot().await.unwrap(), CounterSnapshot::default());

        counter.restore(snapshot.clone()).await.unwrap();
        assert_eq!(counter.snapshot().await.unwrap(), snapshot);

        counter.clear().await.unwrap();
    }
}
