//! User-data bag and codec.
//!
//! The broker persists a flat string-to-string map per resource. Structured
//! values are JSON-encoded strings under well-known keys. Extraction
//! distinguishes a missing key from a value that fails to decode, because
//! lease reclaim treats absence as routine while the Releaser treats it as
//! a broken request.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Key under which a primary's leased secondary names are persisted.
///
/// This is the only key the pipeline core defines; constructors are free to
/// add their own.
pub const LEASED_RESOURCES: &str = "leasedResources";

/// Errors from the user-data codec.
#[derive(Debug, Error)]
pub enum UserDataError {
    /// The key is not present in the map.
    #[error("user data key {key:?} not found")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The key is present but its value failed to decode.
    #[error("failed to decode user data key {key:?}: {source}")]
    Decode {
        /// The key whose value was malformed.
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The value failed to encode.
    #[error("failed to encode user data key {key:?}: {source}")]
    Encode {
        /// The key being written.
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl UserDataError {
    /// Returns true for the expected missing-key case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, UserDataError::NotFound { .. })
    }
}

/// String-keyed payload persisted with a resource in the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserData {
    entries: BTreeMap<String, String>,
}

impl UserData {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `value` as JSON and stores it under `key`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), UserDataError> {
        let encoded = serde_json::to_string(value).map_err(|source| UserDataError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.entries.insert(key.to_string(), encoded);
        Ok(())
    }

    /// Decodes the value under `key`.
    ///
    /// Returns [`UserDataError::NotFound`] when the key is absent so callers
    /// can treat absence as non-fatal.
    pub fn extract<T: DeserializeOwned>(&self, key: &str) -> Result<T, UserDataError> {
        let raw = self.entries.get(key).ok_or_else(|| UserDataError::NotFound {
            key: key.to_string(),
        })?;
        serde_json::from_str(raw).map_err(|source| UserDataError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Merges `other` into this map by key.
    ///
    /// An empty-string value deletes the key. The broker's update API only
    /// merges, so an explicit empty value is the one way to clear a key
    /// through it; the in-memory merge mirrors that contract.
    pub fn update(&mut self, other: &UserData) {
        for (key, value) in &other.entries {
            if value.is_empty() {
                self.entries.remove(key);
            } else {
                self.entries.insert(key.clone(), value.clone());
            }
        }
    }

    /// Stores a raw, already-encoded value under `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Removes `key`, returning the raw value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Returns the raw value under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns true when `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns true when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A map that deletes `key` when merged via [`UserData::update`].
    pub fn tombstone(key: &str) -> Self {
        let mut data = Self::new();
        data.insert(key, "");
        data
    }
}
