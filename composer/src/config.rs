//! Resource configuration: file format, parsing, and census validation.
//!
//! A [`ResourceConfig`] names the primary resource type it governs, the
//! secondary types and counts the primary needs, and the constructor that
//! assembles the compound. The on-disk format is a YAML document:
//!
//! ```yaml
//! configs:
//!   - name: gke-cluster
//!     type: gke-project
//!     needs:
//!       vm: 2
//!     config:
//!       type: greeting
//!       content: hi
//! ```

use crate::resource::{Resource, ResourceNeeds};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors from parsing, writing, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file {path:?} does not exist")]
    Missing {
        /// Path that was looked up.
        path: String,
    },

    /// The config file exists but could not be read or written.
    #[error("failed to access config file {path:?}: {source}")]
    Io {
        /// Path being accessed.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file content is not a valid config document.
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// Two configs share a name.
    #[error("config {name:?} already exists")]
    DuplicateName {
        /// The repeated config name.
        name: String,
    },

    /// A needs entry references a type absent from the census.
    #[error("need for resource type {rtype:?} that does not exist")]
    UnknownNeed {
        /// The type no census resource carries.
        rtype: String,
    },

    /// The census cannot satisfy the accumulated needs for a type.
    #[error("not enough resources of type {rtype:?} for provisioning: need {needed}, have {available}")]
    NotEnoughResources {
        /// The oversubscribed type.
        rtype: String,
        /// Total count required across configs.
        needed: usize,
        /// Count present in the census.
        available: usize,
    },
}

/// Selects and parameterizes one constructor factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructorDescriptor {
    /// Registry tag of the factory to apply.
    #[serde(rename = "type")]
    pub ctype: String,

    /// Opaque payload handed verbatim to the factory.
    pub content: String,
}

/// Named bundle governing how one primary type is recycled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique config name.
    pub name: String,

    /// Primary resource type this config governs.
    #[serde(rename = "type")]
    pub rtype: String,

    /// Secondary type -> required count.
    pub needs: ResourceNeeds,

    /// Constructor selection for the compound.
    pub config: ConstructorDescriptor,
}

/// Top-level shape of the YAML config document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    configs: Vec<ResourceConfig>,
}

/// Reads the config list from the YAML document at `path`.
pub fn parse_config(path: impl AsRef<Path>) -> Result<Vec<ResourceConfig>, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Missing {
            path: path.display().to_string(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file: ConfigFile = serde_yaml::from_str(&content)?;
    Ok(file.configs)
}

/// Writes the config list as a YAML document to `path`.
///
/// Counterpart of [`parse_config`]; `parse_config(write_config(c)) == c`.
pub fn write_config(
    path: impl AsRef<Path>,
    configs: &[ResourceConfig],
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let file = ConfigFile {
        configs: configs.to_vec(),
    };
    let content = serde_yaml::to_string(&file)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Validates `configs` against a broker resource census.
///
/// Checks that config names are unique, that every type referenced in any
/// needs vector exists in the census, and that the census holds enough
/// resources of each type to satisfy the accumulated needs of every config
/// whose primary type appears in the census. Never mutates anything; a
/// failed validation leaves whatever store the caller holds untouched.
pub fn validate_config(
    configs: &[ResourceConfig],
    census: &[Resource],
) -> Result<(), ConfigError> {
    let mut by_primary_type: HashMap<&str, &ResourceNeeds> = HashMap::new();
    let mut names = HashSet::new();
    for config in configs {
        if !names.insert(config.name.as_str()) {
            return Err(ConfigError::DuplicateName {
                name: config.name.clone(),
            });
        }
        by_primary_type.entry(config.rtype.as_str()).or_insert(&config.needs);
    }

    let mut census_counts: HashMap<&str, usize> = HashMap::new();
    for resource in census {
        *census_counts.entry(resource.rtype.as_str()).or_default() += 1;
    }

    for config in configs {
        for rtype in config.needs.keys() {
            if !census_counts.contains_key(rtype.as_str()) {
                return Err(ConfigError::UnknownNeed {
                    rtype: rtype.clone(),
                });
            }
        }
    }

    // Each census resource governed by a config adds that config's needs to
    // the total demand for its secondary types.
    let mut needed: HashMap<&str, usize> = HashMap::new();
    for resource in census {
        if let Some(needs) = by_primary_type.get(resource.rtype.as_str()) {
            for (rtype, count) in needs.iter() {
                *needed.entry(rtype.as_str()).or_default() += count;
            }
        }
    }

    for (rtype, required) in needed {
        let available = census_counts.get(rtype).copied().unwrap_or(0);
        if required > available {
            return Err(ConfigError::NotEnoughResources {
                rtype: rtype.to_string(),
                needed: required,
                available,
            });
        }
    }
    Ok(())
}
