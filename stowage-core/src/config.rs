use std::path::Path;

use serde::{Deserialize, Serialize};
use stowage_model::StorageId;

use crate::error::{Result, StorageError};

/// Prefix for environment overrides, e.g. `STOWAGE__DISPATCH__PAGE_SIZE=200`.
pub const ENV_PREFIX: &str = "STOWAGE";

/// Global knobs that tune engine behaviour.
///
/// All fields carry defaults so a deployment only has to list its backends.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Periodic dispatch cadence and distributed lock settings.
    pub scheduler: SchedulerConfig,
    /// Batch sizing for the backend dispatcher.
    pub dispatch: DispatchConfig,
    /// Outbound lifecycle event channel sizing.
    pub events: EventConfig,
    /// Completion report channel sizing.
    pub completion: CompletionConfig,
    /// Storage locations served by a backend plugin.
    pub backends: Vec<BackendConfig>,
}

impl EngineConfig {
    /// Loads configuration from an optional TOML file layered with
    /// `STOWAGE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.page_size == 0 {
            return Err(StorageError::Configuration(
                "dispatch.page_size must be greater than zero".into(),
            ));
        }
        if self.scheduler.period_ms == 0 {
            return Err(StorageError::Configuration(
                "scheduler.period_ms must be greater than zero".into(),
            ));
        }
        if self.scheduler.lock_ttl_secs == 0 {
            return Err(StorageError::Configuration(
                "scheduler.lock_ttl_secs must be greater than zero".into(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(StorageError::Configuration(
                "events.channel_capacity must be greater than zero".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(&backend.storage_id) {
                return Err(StorageError::Configuration(format!(
                    "storage '{}' is configured more than once",
                    backend.storage_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between two dispatch cycles (milliseconds).
    pub period_ms: u64,
    /// TTL of the distributed dispatch lock (seconds). Must outlive a cycle.
    pub lock_ttl_secs: u64,
    /// Task name the lock is scoped to; the tenant id is appended.
    pub lock_name: String,
}

impl SchedulerConfig {
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.period_ms)
    }

    pub fn lock_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_ms: 3_000,
            lock_ttl_secs: 60,
            lock_name: "file-request-dispatch".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Requests read from the store per page.
    pub page_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { page_size: 1_000 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub channel_capacity: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
        }
    }
}

/// One configured storage location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    pub storage_id: StorageId,
    /// Name of the plugin factory that builds the backend.
    pub plugin: String,
    #[serde(default = "BackendConfig::default_enabled")]
    pub enabled: bool,
    /// Plugin-specific parameters, handed to the factory untouched.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl BackendConfig {
    const fn default_enabled() -> bool {
        true
    }

    /// Deserializes the plugin settings into the factory's own type.
    pub fn settings_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.settings.clone())?)
    }
}
