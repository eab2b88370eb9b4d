use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Group used for tasks submitted without an explicit cohort.
pub const DEFAULT_GROUP: &str = "default";
/// Family used when the producer does not name one.
pub const DEFAULT_FAMILY: &str = "Task";
/// Longest a task can be pushed into the future.
pub const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

/// A `Task` is a single unit of work routed through a scheduler and executed
/// by a worker. Besides the payload of type `D` it carries everything the
/// engine needs to schedule it: priority, the time it becomes ready, its
/// retry budget, an optional dedup key, an optional resource key used for
/// per-host admission, and the cohort it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task<D: Clone> {
    pub task_id: TaskId,
    pub payload: D,
    pub family: String,
    pub status: TaskStatus,
    /// Higher runs first among ready tasks.
    pub priority: i64,
    pub ready_at: SystemTime,
    pub queued_at: SystemTime,
    pub last_started_at: Option<SystemTime>,
    pub tries: u32,
    /// `None` means the engine-wide default applies.
    pub max_tries: Option<u32>,
    /// Identity for duplicate suppression. `None` disables filtering.
    pub dedup_key: Option<String>,
    pub resource_key: Option<String>,
    pub group_id: String,
    pub recrawl: Option<Duration>,
    /// Failures of this task are never retried.
    pub ignore_errors: bool,
    pub error_msg: Option<String>,
}

impl<D: Clone> Task<D> {
    pub fn new(payload: D) -> Self {
        let now = SystemTime::now();
        Task {
            task_id: TaskId::new(),
            payload,
            family: DEFAULT_FAMILY.to_string(),
            status: TaskStatus::Queued,
            priority: 0,
            ready_at: now,
            queued_at: now,
            last_started_at: None,
            tries: 0,
            max_tries: None,
            dedup_key: None,
            resource_key: None,
            group_id: DEFAULT_GROUP.to_string(),
            recrawl: None,
            ignore_errors: false,
            error_msg: None,
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_recrawl(mut self, interval: Duration) -> Self {
        self.recrawl = Some(interval);
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Delay the first execution by `delay` from now, capped at
    /// [`MAX_DELAY`].
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_at = deadline(SystemTime::now(), delay);
        self
    }

    /// Tasks without a dedup key are always admitted.
    pub fn dont_filter(&self) -> bool {
        self.dedup_key.is_none()
    }

    pub fn is_ready(&self, now: SystemTime) -> bool {
        self.ready_at <= now
    }

    /// Move readiness forward to `at`. Readiness never moves backwards, so a
    /// retry can't run earlier than previously requested.
    pub fn defer_until(&mut self, at: SystemTime) {
        if at > self.ready_at {
            self.ready_at = at;
        }
    }

    pub fn set_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
        self.last_started_at = Some(SystemTime::now());
    }

    pub fn set_succeed(&mut self) {
        self.status = TaskStatus::Completed;
        self.error_msg = None;
    }

    pub fn set_retry(&mut self, err_msg: &str) {
        self.status = TaskStatus::Failed;
        self.tries += 1;
        self.error_msg = Some(err_msg.to_string());
    }

    pub fn set_dlq(&mut self, err_msg: &str) {
        self.status = TaskStatus::DeadLetter;
        self.error_msg = Some(err_msg.to_string());
    }

    pub fn set_status(&mut self, new_status: TaskStatus) {
        self.status = new_status;
    }

    pub fn get_payload(&self) -> &D {
        &self.payload
    }
}

impl<D: Clone> std::fmt::Display for Task<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Task {} {}>", self.family, self.task_id)
    }
}

/// Deterministic identity for a task built from its semantic parts,
/// e.g. `fingerprint(["GET", "https://example.com/a"])`.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for (idx, part) in parts.into_iter().enumerate() {
        if idx > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// `from + delay` with `delay` capped at [`MAX_DELAY`]. Never panics.
pub fn deadline(from: SystemTime, delay: Duration) -> SystemTime {
    from.checked_add(delay.min(MAX_DELAY)).unwrap_or(from)
}

/// Seconds since the unix epoch, used as a sortable score by shared
/// backends. Times before the epoch clamp to zero.
pub fn epoch_secs(at: SystemTime) -> f64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn epoch_micros(at: SystemTime) -> u128 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

//*****************************************************************************
// TaskId with ser/de traits implemented (to convert underlaying Uuid)
//*****************************************************************************

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskId(Uuid::parse_str(s)?))
    }
}

// Custom serialization for TaskId.
impl serde::Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Directly serialize the inner Uuid.
        self.0.serialize(serializer)
    }
}

// Custom deserialization for TaskId.
impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Deserialize a Uuid and then wrap it in a TaskId.
        let uuid = Uuid::deserialize(deserializer)?;
        Ok(TaskId(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_defaults() {
        let task = Task::new(42u32);
        assert_eq!(task.priority, 0);
        assert_eq!(task.tries, 0);
        assert_eq!(task.group_id, DEFAULT_GROUP);
        assert!(task.dont_filter());
        assert!(task.is_ready(SystemTime::now()));
    }

    #[test]
    fn ready_after_gates_readiness() {
        let task = Task::new(()).ready_after(Duration::from_secs(5));
        assert!(!task.is_ready(SystemTime::now()));
        assert!(task.is_ready(SystemTime::now() + Duration::from_secs(6)));
    }

    #[test]
    fn huge_delays_are_capped() {
        let now = SystemTime::now();
        assert_eq!(deadline(now, Duration::MAX), now + MAX_DELAY);
        assert_eq!(deadline(now, Duration::from_secs(3)), now + Duration::from_secs(3));

        let task = Task::new(()).ready_after(Duration::MAX);
        assert!(!task.is_ready(SystemTime::now() + MAX_DELAY / 2));
        assert!(task.ready_at <= SystemTime::now() + MAX_DELAY);
    }

    #[test]
    fn defer_until_never_moves_backwards() {
        let mut task = Task::new(()).ready_after(Duration::from_secs(10));
        let before = task.ready_at;
        task.defer_until(SystemTime::now());
        assert_eq!(task.ready_at, before);
        task.defer_until(before + Duration::from_secs(1));
        assert!(task.ready_at > before);
    }

    #[test]
    fn fingerprint_is_deterministic_and_part_aware() {
        let a = fingerprint(["GET", "https://example.com/"]);
        let b = fingerprint(["GET", "https://example.com/"]);
        let c = fingerprint(["GETh", "ttps://example.com/"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn task_id_roundtrips_through_string() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn display_contains_family() {
        let task = Task::new(()).with_family("Request");
        assert!(task.to_string().starts_with("<Task Request "));
    }
}
