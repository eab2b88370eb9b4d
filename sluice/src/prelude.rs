pub use crate::config::{Configurable, EngineConfig};
pub use crate::manager::{
    Computation, ComputationError, Counter, Engine, EngineError, EngineHandle,
    Hook, HookRegistration, Outcome, Spawner, WorkerId,
};
pub use crate::queue::{DEFAULT_GROUP, Task, fingerprint};
pub use async_trait::async_trait;
