use serde_yaml::Value;
use std::{fs, path};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub trait Configurable {
    fn config(&self) -> &Value;

    // read configuration from yaml config
    fn load_config(
        config_file_path: impl AsRef<path::Path>,
    ) -> Result<Value, ConfigError> {
        let content: String = fs::read_to_string(config_file_path)?;
        let config: Value = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Extract Value from config using dot notation i.e. "engine.workers"
    fn get_config_value(&self, key: &str) -> Option<&Value> {
        let keys: Vec<&str> = key.split('.').collect();
        Self::get_value_recursive(self.config(), &keys)
    }

    fn get_value_recursive<'a>(
        config: &'a Value,
        keys: &[&str],
    ) -> Option<&'a Value> {
        let (key, remaining_keys) = keys.split_first()?;
        match config {
            Value::Mapping(map) => {
                let value = map.get(Value::String(key.to_string()))?;
                if remaining_keys.is_empty() {
                    Some(value)
                } else {
                    Self::get_value_recursive(value, remaining_keys)
                }
            }
            _ => None,
        }
    }
}
