//! Per-resource admission control.
//!
//! Two independent budgets guard every resource key: a cap shared by all
//! keys (`max_requests_per_host`) and the caps of every configured pattern
//! the key matches. A task is admitted only when all of them have a free
//! slot; the slots come back when the returned [`Admission`] is dropped.
use rand::Rng;
use sluice_config::{ConfigError, EngineConfig, ResourcePattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::manager::CounterError;

/// Pacing delays are jittered by ±20% around the configured base.
const JITTER: std::ops::RangeInclusive<f64> = 0.8..=1.2;

/// Slots reserved for one task. Released on drop, whatever happened to
/// the task in between.
#[derive(Debug, Default)]
pub struct Admission {
    permits: Vec<OwnedSemaphorePermit>,
}

impl Admission {
    pub fn slots(&self) -> usize {
        self.permits.len()
    }
}

/// Keeps the live concurrency gauge up while a gated task executes.
#[derive(Debug)]
pub struct ActiveGuard {
    gauge: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ResourceLimiter {
    per_key_cap: usize,
    per_key: Mutex<HashMap<String, Arc<Semaphore>>>,
    patterns: Vec<(ResourcePattern<usize>, Arc<Semaphore>)>,
    default_delay: Duration,
    delay_patterns: Vec<ResourcePattern<Duration>>,
    active: Arc<AtomicUsize>,
}

impl ResourceLimiter {
    pub fn new(
        per_key_cap: usize,
        patterns: Vec<ResourcePattern<usize>>,
        default_delay: Duration,
        delay_patterns: Vec<ResourcePattern<Duration>>,
    ) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let slots = Arc::new(Semaphore::new(p.value));
                (p, slots)
            })
            .collect();
        Self {
            per_key_cap,
            per_key: Mutex::new(HashMap::new()),
            patterns,
            default_delay,
            delay_patterns,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// No caps, no pacing.
    pub fn unlimited() -> Self {
        Self::new(0, Vec::new(), Duration::ZERO, Vec::new())
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.max_requests_per_host,
            config.concurrency_patterns()?,
            config.download_delay,
            config.delay_patterns()?,
        ))
    }

    fn key_slots(
        &self,
        resource_key: &str,
    ) -> Result<Option<Arc<Semaphore>>, CounterError> {
        if self.per_key_cap == 0 {
            return Ok(None);
        }
        let mut per_key = self
            .per_key
            .lock()
            .map_err(|e| CounterError::Backend(e.to_string()))?;
        let slots = per_key
            .entry(resource_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_key_cap)));
        Ok(Some(slots.clone()))
    }

    /// Reserve a slot in every budget `resource_key` falls under, or none
    /// at all.
    pub fn try_admit(&self, resource_key: &str) -> Result<Admission, CounterError> {
        let mut admission = Admission::default();

        if let Some(slots) = self.key_slots(resource_key)? {
            let permit = slots
                .try_acquire_owned()
                .map_err(|_| CounterError::Capacity(resource_key.to_string()))?;
            admission.permits.push(permit);
        }

        for (pattern, slots) in &self.patterns {
            if !pattern.matches(resource_key) {
                continue;
            }
            // Permits already taken go back when `admission` drops here.
            let permit = slots
                .clone()
                .try_acquire_owned()
                .map_err(|_| CounterError::Capacity(resource_key.to_string()))?;
            admission.permits.push(permit);
        }

        Ok(admission)
    }

    /// Wait the pacing delay for `resource_key`, then try to admit.
    pub async fn admit(&self, resource_key: &str) -> Result<Admission, CounterError> {
        let delay = self.pacing_delay(resource_key);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.try_admit(resource_key)
    }

    /// Base delay for the key (first matching pattern, else the default),
    /// jittered.
    pub fn pacing_delay(&self, resource_key: &str) -> Duration {
        let base = self
            .delay_patterns
            .iter()
            .find(|p| p.matches(resource_key))
            .map(|p| p.value)
            .unwrap_or(self.default_delay);
        if base.is_zero() {
            return base;
        }
        let jitter = rand::rng().random_range(JITTER);
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(base)
    }

    /// Smallest number of free slots across the budgets `resource_key`
    /// falls under. `None` when nothing limits it.
    pub fn available(&self, resource_key: &str) -> Result<Option<usize>, CounterError> {
        let mut free: Option<usize> = None;
        if let Some(slots) = self.key_slots(resource_key)? {
            free = Some(slots.available_permits());
        }
        for (pattern, slots) in &self.patterns {
            if pattern.matches(resource_key) {
                let n = slots.available_permits();
                free = Some(free.map_or(n, |f| f.min(n)));
            }
        }
        Ok(free)
    }

    pub fn begin_active(&self) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            gauge: self.active.clone(),
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ResourceLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<(&str, usize)> = self
            .patterns
            .iter()
            .map(|(p, _)| (p.pattern(), p.value))
            .collect();
        f.debug_struct("ResourceLimiter")
            .field("per_key_cap", &self.per_key_cap)
            .field("patterns", &patterns)
            .field("default_delay", &self.default_delay)
            .field("active", &self.active_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern<T>(p: &str, value: T) -> ResourcePattern<T> {
        ResourcePattern::new(p, value).unwrap()
    }

    #[test]
    fn per_key_cap_limits_each_key_separately() {
        let limiter = ResourceLimiter::new(2, vec![], Duration::ZERO, vec![]);
        let a1 = limiter.try_admit("a.com").unwrap();
        let _a2 = limiter.try_admit("a.com").unwrap();
        assert!(matches!(
            limiter.try_admit("a.com"),
            Err(CounterError::Capacity(_))
        ));
        // other keys have their own budget
        let _b = limiter.try_admit("b.com").unwrap();

        drop(a1);
        assert!(limiter.try_admit("a.com").is_ok());
    }

    #[test]
    fn all_matching_patterns_must_have_room() {
        let limiter = ResourceLimiter::new(
            0,
            vec![pattern("^api\\.", 5), pattern("example\\.com", 1)],
            Duration::ZERO,
            vec![],
        );
        let first = limiter.try_admit("api.example.com").unwrap();
        assert_eq!(first.slots(), 2);
        // `example.com` budget is used up, so the `^api.` slot taken for
        // the refused attempt must come back.
        assert!(limiter.try_admit("api.example.com").is_err());
        assert!(limiter.try_admit("www.example.com").is_err());
        assert_eq!(limiter.available("api.other.org").unwrap(), Some(4));

        drop(first);
        assert_eq!(limiter.available("api.example.com").unwrap(), Some(1));
    }

    #[test]
    fn unmatched_keys_are_unlimited() {
        let limiter = ResourceLimiter::new(
            0,
            vec![pattern("example\\.com", 1)],
            Duration::ZERO,
            vec![],
        );
        assert_eq!(limiter.available("rust-lang.org").unwrap(), None);
        let admission = limiter.try_admit("rust-lang.org").unwrap();
        assert_eq!(admission.slots(), 0);
    }

    #[test]
    fn pacing_delay_is_jittered_around_base() {
        let limiter = ResourceLimiter::new(
            0,
            vec![],
            Duration::from_millis(100),
            vec![pattern("slow\\.org", Duration::from_secs(1))],
        );
        for _ in 0..50 {
            let d = limiter.pacing_delay("fast.com");
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
            let d = limiter.pacing_delay("www.slow.org");
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(
            ResourceLimiter::unlimited().pacing_delay("x"),
            Duration::ZERO
        );
    }

    #[test]
    fn huge_pacing_delay_saturates() {
        let limiter = ResourceLimiter::new(0, vec![], Duration::MAX, vec![]);
        for _ in 0..20 {
            let d = limiter.pacing_delay("a.com");
            assert!(d > Duration::from_secs(u64::MAX / 2));
        }
    }

    #[test]
    fn active_gauge_follows_guards() {
        let limiter = ResourceLimiter::unlimited();
        let g1 = limiter.begin_active();
        let g2 = limiter.begin_active();
        assert_eq!(limiter.active_requests(), 2);
        drop(g1);
        assert_eq!(limiter.active_requests(), 1);
        drop(g2);
        assert_eq!(limiter.active_requests(), 0);
    }

    #[tokio::test]
    async fn admit_waits_for_pacing() {
        let limiter =
            ResourceLimiter::new(1, vec![], Duration::from_millis(100), vec![]);
        let started = std::time::Instant::now();
        let _admission = limiter.admit("a.com").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(limiter.admit("a.com").await.is_err());
    }
}
