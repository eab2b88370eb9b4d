//! Encoding of tasks for backends that store them outside process memory.
use crate::{Task, TaskQueueError};
use serde::{Serialize, de::DeserializeOwned};

pub trait TaskCodec: Send + Sync + 'static {
    fn encode<D>(task: &Task<D>) -> Result<String, TaskQueueError>
    where
        D: Clone + Serialize + DeserializeOwned;

    fn decode<D>(data: &str) -> Result<Task<D>, TaskQueueError>
    where
        D: Clone + Serialize + DeserializeOwned;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl TaskCodec for JsonCodec {
    fn encode<D>(task: &Task<D>) -> Result<String, TaskQueueError>
    where
        D: Clone + Serialize + DeserializeOwned,
    {
        serde_json::to_string(task)
            .map_err(|e| TaskQueueError::Serialization(e.to_string()))
    }

    fn decode<D>(data: &str) -> Result<Task<D>, TaskQueueError>
    where
        D: Clone + Serialize + DeserializeOwned,
    {
        serde_json::from_str(data)
            .map_err(|e| TaskQueueError::Deserialization(e.to_string()))
    }
}
