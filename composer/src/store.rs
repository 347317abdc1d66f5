//! In-memory configuration store.
//!
//! Holds the active set of resource configs keyed by name. Every pipeline
//! stage reads it; [`ConfigStore::sync_configs`] atomically replaces the
//! whole set and is safe to call while stages are reading.

use crate::config::ResourceConfig;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Errors from config store lookups and syncs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No config governs the given primary type.
    #[error("no config for resource type {rtype:?}")]
    NotFound {
        /// The primary type that was looked up.
        rtype: String,
    },

    /// A sync attempted to install two configs with the same name.
    #[error("config {name:?} already exists")]
    DuplicateName {
        /// The repeated config name.
        name: String,
    },
}

/// Guarded map of active configs, keyed by config name.
#[derive(Debug, Default)]
pub struct ConfigStore {
    configs: RwLock<HashMap<String, ResourceConfig>>,
}

impl ConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the config whose primary type equals `rtype`.
    pub fn get_config(&self, rtype: &str) -> Result<ResourceConfig, StoreError> {
        let configs = self.configs.read().expect("config store lock poisoned");
        configs
            .values()
            .find(|config| config.rtype == rtype)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                rtype: rtype.to_string(),
            })
    }

    /// Returns a snapshot of every active config.
    pub fn get_configs(&self) -> Vec<ResourceConfig> {
        let configs = self.configs.read().expect("config store lock poisoned");
        configs.values().cloned().collect()
    }

    /// Atomically replaces the active set.
    ///
    /// Refuses sets with duplicate names; on error the previous set stays
    /// in place.
    pub fn sync_configs(&self, new_configs: Vec<ResourceConfig>) -> Result<(), StoreError> {
        let mut replacement = HashMap::with_capacity(new_configs.len());
        for config in new_configs {
            if replacement.contains_key(&config.name) {
                return Err(StoreError::DuplicateName { name: config.name });
            }
            replacement.insert(config.name.clone(), config);
        }
        let mut configs = self.configs.write().expect("config store lock poisoned");
        *configs = replacement;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConstructorDescriptor;
    use crate::resource::ResourceNeeds;

    fn sample_config(name: &str, rtype: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            rtype: rtype.to_string(),
            needs: ResourceNeeds::new(),
            config: ConstructorDescriptor {
                ctype: "noop".to_string(),
                content: String::new(),
            },
        }
    }

    #[test]
    fn test_get_config_finds_by_primary_type() {
        let store = ConfigStore::new();
        store
            .sync_configs(vec![
                sample_config("cluster", "project"),
                sample_config("bundle", "host"),
            ])
            .unwrap();

        let config = store.get_config("host").unwrap();
        assert_eq!(config.name, "bundle");
    }

    #[test]
    fn test_get_config_missing_type() {
        let store = ConfigStore::new();
        let err = store.get_config("project").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_sync_replaces_previous_set() {
        let store = ConfigStore::new();
        store
            .sync_configs(vec![sample_config("cluster", "project")])
            .unwrap();
        store
            .sync_configs(vec![sample_config("bundle", "host")])
            .unwrap();

        assert!(store.get_config("project").is_err());
        assert_eq!(store.get_configs().len(), 1);
    }

    #[test]
    fn test_sync_rejects_duplicate_names_without_mutating() {
        let store = ConfigStore::new();
        store
            .sync_configs(vec![sample_config("cluster", "project")])
            .unwrap();

        let err = store
            .sync_configs(vec![
                sample_config("bundle", "host"),
                sample_config("bundle", "vm"),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName { .. }));

        // Previous set still active.
        assert!(store.get_config("project").is_ok());
    }
}
