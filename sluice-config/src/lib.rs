pub mod config;
pub mod engine;

pub use config::{ConfigError, Configurable};
pub use engine::{
    BackendConfig, BackendKind, EngineConfig, MAX_DURATION, PersistenceConfig,
    ResourcePattern,
};
