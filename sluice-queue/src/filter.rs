//! Duplicate filters answer "was this fingerprint accepted before" exactly
//! once per fingerprint.
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::TaskQueueError;

#[async_trait]
pub trait DuplicateFilter: Send + Sync {
    async fn start(&self) -> Result<(), TaskQueueError> {
        Ok(())
    }

    /// Returns `false` and records the fingerprint on first sight, `true`
    /// on every later call. Check and insert are a single atomic step.
    async fn seen(&self, fingerprint: &str) -> Result<bool, TaskQueueError>;

    async fn contains(&self, fingerprint: &str) -> Result<bool, TaskQueueError>;

    /// Drop a single fingerprint so it is admitted again.
    async fn forget(&self, fingerprint: &str) -> Result<(), TaskQueueError>;

    async fn clear(&self) -> Result<(), TaskQueueError>;

    async fn len(&self) -> Result<usize, TaskQueueError>;

    async fn fingerprints(&self) -> Result<Vec<String>, TaskQueueError>;

    async fn restore(&self, fingerprints: Vec<String>)
    -> Result<(), TaskQueueError>;

    async fn close(&self) -> Result<(), TaskQueueError> {
        Ok(())
    }
}

pub type AbstractDuplicateFilter = Arc<dyn DuplicateFilter + Send + Sync>;

/// Process-local filter backed by a `HashSet`.
#[derive(Debug, Default)]
pub struct InMemoryDuplicateFilter {
    fingerprints: Mutex<HashSet<String>>,
}

impl InMemoryDuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashSet<String>>, TaskQueueError> {
        self.fingerprints
            .lock()
            .map_err(|e| TaskQueueError::QueueError(e.to_string()))
    }
}

#[async_trait]
impl DuplicateFilter for InMemoryDuplicateFilter {
    async fn seen(&self, fingerprint: &str) -> Result<bool, TaskQueueError> {
        Ok(!self.lock()?.insert(fingerprint.to_string()))
    }

    async fn contains(&self, fingerprint: &str) -> Result<bool, TaskQueueError> {
        Ok(self.lock()?.contains(fingerprint))
    }

    async fn forget(&self, fingerprint: &str) -> Result<(), TaskQueueError> {
        self.lock()?.remove(fingerprint);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TaskQueueError> {
        self.lock()?.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, TaskQueueError> {
        Ok(self.lock()?.len())
    }

    async fn fingerprints(&self) -> Result<Vec<String>, TaskQueueError> {
        let mut fps: Vec<String> = self.lock()?.iter().cloned().collect();
        fps.sort();
        Ok(fps)
    }

    async fn restore(
        &self,
        fingerprints: Vec<String>,
    ) -> Result<(), TaskQueueError> {
        self.lock()?.extend(fingerprints);
        Ok(())
    }
}
