use crate::manager::{Spawner, WorkerId};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use sluice_queue::{MAX_DELAY, Task};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Everything a computation can report besides plain success. `Skip` and
/// `Reschedule` are control signals, the rest are failures that consume
/// one try from the task's budget.
#[derive(Error, Debug)]
pub enum ComputationError {
    #[error("Task skipped")]
    Skip,
    #[error("Task rescheduled in {delay:?}")]
    Reschedule {
        delay: Duration,
        recrawl: Option<Duration>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Computation execution error: {0}")]
    Function(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Computation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ComputationError {
    pub fn reschedule(delay: Duration) -> Self {
        Self::Reschedule {
            delay,
            recrawl: None,
        }
    }
}

/// Tagged result of one attempt, switched on by the worker loop. A
/// reschedule further out than [`MAX_DELAY`] is a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    SoftSkip,
    Reschedule {
        delay: Duration,
        recrawl: Option<Duration>,
    },
    Failure(String),
}

impl From<Result<(), ComputationError>> for Outcome {
    fn from(result: Result<(), ComputationError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(ComputationError::Skip) => Outcome::SoftSkip,
            Err(ComputationError::Reschedule { delay, .. }) if delay > MAX_DELAY => {
                Outcome::Failure(format!(
                    "Reschedule delay {delay:?} exceeds {MAX_DELAY:?}"
                ))
            }
            Err(ComputationError::Reschedule { delay, recrawl }) => {
                Outcome::Reschedule { delay, recrawl }
            }
            Err(err) => Outcome::Failure(format!("{err:#}")),
        }
    }
}

/// A trait defining the interface for processing a task. Follow-up tasks
/// and result records go through `spawner`; they are forwarded in the
/// order they were produced, whatever the outcome of the call.
#[async_trait]
pub trait Computation<Data, Ctx>
where
    Data: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    /// Processes the task. The worker_id is passed for logging or
    /// debugging purposes. The task is a mutable reference,
    /// allowing the processor to modify the task data as part of the processing.
    async fn call(
        &self,
        worker_id: WorkerId,
        ctx: Arc<Ctx>,
        task: &mut Task<Data>,
        spawner: &mut Spawner<Data>,
    ) -> Result<(), ComputationError>;
}
