use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use stowage_model::StorageId;
use tracing::info;

use super::{BackendFactory, BackendKind, StorageBackend};
use crate::config::BackendConfig;
use crate::error::{Result, StorageError};

struct BackendEntry {
    backend: Arc<dyn StorageBackend>,
    enabled: bool,
}

/// Storage id → backend table, populated at startup and toggled at runtime.
#[derive(Default)]
pub struct BackendRegistry {
    entries: DashMap<StorageId, BackendEntry>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut storages: Vec<(String, bool)> = self
            .entries
            .iter()
            .map(|e| (e.key().to_string(), e.value().enabled))
            .collect();
        storages.sort();
        f.debug_struct("BackendRegistry")
            .field("storages", &storages)
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration, resolving each entry's plugin
    /// against `factories`.
    pub fn from_config(
        configs: &[BackendConfig],
        factories: &[Arc<dyn BackendFactory>],
    ) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            let factory = factories
                .iter()
                .find(|f| f.plugin() == config.plugin)
                .ok_or_else(|| {
                    StorageError::Configuration(format!(
                        "no backend plugin named '{}' for storage '{}'",
                        config.plugin, config.storage_id
                    ))
                })?;
            let backend = factory.create(config)?;
            info!(
                storage = %config.storage_id,
                plugin = %config.plugin,
                enabled = config.enabled,
                "registered storage backend"
            );
            registry.register_with_state(
                config.storage_id.clone(),
                backend,
                config.enabled,
            );
        }
        Ok(registry)
    }

    pub fn register(
        &self,
        storage_id: StorageId,
        backend: Arc<dyn StorageBackend>,
    ) {
        self.register_with_state(storage_id, backend, true);
    }

    pub fn register_with_state(
        &self,
        storage_id: StorageId,
        backend: Arc<dyn StorageBackend>,
        enabled: bool,
    ) {
        self.entries
            .insert(storage_id, BackendEntry { backend, enabled });
    }

    /// The backend for `storage_id`, if configured and enabled.
    pub fn enabled(
        &self,
        storage_id: &StorageId,
    ) -> Option<Arc<dyn StorageBackend>> {
        self.entries
            .get(storage_id)
            .filter(|entry| entry.enabled)
            .map(|entry| Arc::clone(&entry.backend))
    }

    /// Whether the storage id names a backend, enabled or not.
    pub fn is_configured(&self, storage_id: &StorageId) -> bool {
        self.entries.contains_key(storage_id)
    }

    pub fn kind_of(&self, storage_id: &StorageId) -> Option<BackendKind> {
        self.entries
            .get(storage_id)
            .map(|entry| entry.backend.kind())
    }

    /// Returns false when the storage id is not configured.
    pub fn set_enabled(&self, storage_id: &StorageId, enabled: bool) -> bool {
        match self.entries.get_mut(storage_id) {
            Some(mut entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn storage_ids(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> =
            self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
