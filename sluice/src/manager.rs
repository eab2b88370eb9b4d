pub mod computation;
pub mod counter;
pub mod dispatcher;
pub mod engine;
pub mod hooks;
pub mod limiter;
pub mod persist;
#[cfg(feature = "redis")]
pub mod redis_counter;
pub mod stats;
pub mod worker;

pub use computation::{Computation, ComputationError, Outcome};
pub use counter::{
    AbstractCounter, Counter, CounterError, CounterSnapshot, FamilyCounts,
    LocalCounter, Tally,
};
pub(crate) use dispatcher::BusyGuard;
pub use dispatcher::{Dispatcher, Lane, Spawner};
pub use engine::{Engine, EngineError, EngineHandle};
pub use hooks::{Hook, HookRegistration, Hooks};
pub use limiter::{ActiveGuard, Admission, ResourceLimiter};
pub use persist::EngineSnapshot;
#[cfg(feature = "redis")]
pub use redis_counter::RedisCounter;
pub use stats::{EngineStats, WorkerStats};
pub use worker::{
    Worker, WorkerId, WorkerOptions, WorkerOptionsBuilder,
    WorkerOptionsBuilderError, worker_wrapper,
};
