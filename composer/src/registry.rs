//! Constructor registry.
//!
//! A [`Constructor`] knows how to assemble one family of compound
//! resources: given a primary and the secondaries leased for it, it
//! produces the user data describing the compound. Factories are
//! registered by type tag at startup; a [`ConstructorDescriptor`] in a
//! resource config selects a factory and hands it an opaque content
//! string.
//!
//! Constructors never talk to the broker and must tolerate concurrent
//! calls from multiple cleaner workers.

use crate::config::ConstructorDescriptor;
use crate::resource::{Resource, TypeToResources, UserData};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Failure inside a constructor or its factory.
#[derive(Debug, Clone)]
pub struct ConstructError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl ConstructError {
    /// Creates an error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConstructError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConstructError {}

/// Errors from registering or building constructors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The tag is already taken.
    #[error("a constructor factory for {tag:?} already exists")]
    AlreadyRegistered {
        /// The contested tag.
        tag: String,
    },

    /// No factory is registered under the descriptor's tag.
    #[error("constructor type {tag:?} is not supported")]
    UnknownType {
        /// The unresolved tag.
        tag: String,
    },

    /// The factory rejected the descriptor content.
    #[error("constructor factory failed: {0}")]
    Factory(#[source] ConstructError),
}

/// Assembles the user data describing one compound resource.
pub trait Constructor: Send + Sync {
    /// Produces user data for `primary` given its leased secondaries.
    fn construct(
        &self,
        primary: &Resource,
        leased: &TypeToResources,
    ) -> Result<UserData, ConstructError>;
}

impl std::fmt::Debug for dyn Constructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Constructor").finish_non_exhaustive()
    }
}

/// Builds a [`Constructor`] from a descriptor's content string.
pub type ConstructorFactory =
    Box<dyn Fn(&str) -> Result<Box<dyn Constructor>, ConstructError> + Send + Sync>;

/// Registry of constructor factories, keyed by type tag.
///
/// Populated before the pipeline starts; read-only afterwards.
#[derive(Default)]
pub struct ConstructorRegistry {
    factories: RwLock<HashMap<String, ConstructorFactory>>,
}

impl ConstructorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `tag`.
    pub fn register(
        &self,
        tag: impl Into<String>,
        factory: ConstructorFactory,
    ) -> Result<(), RegistryError> {
        let tag = tag.into();
        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&tag) {
            return Err(RegistryError::AlreadyRegistered { tag });
        }
        factories.insert(tag, factory);
        Ok(())
    }

    /// Applies the factory selected by `descriptor` to its content string.
    pub fn build(
        &self,
        descriptor: &ConstructorDescriptor,
    ) -> Result<Box<dyn Constructor>, RegistryError> {
        let factories = self.factories.read().expect("registry lock poisoned");
        let factory = factories
            .get(&descriptor.ctype)
            .ok_or_else(|| RegistryError::UnknownType {
                tag: descriptor.ctype.clone(),
            })?;
        factory(&descriptor.content).map_err(RegistryError::Factory)
    }
}

impl std::fmt::Debug for ConstructorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().expect("registry lock poisoned");
        f.debug_struct("ConstructorRegistry")
            .field("tags", &factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
