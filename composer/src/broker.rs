//! Broker client contract.
//!
//! The broker owns the authoritative state of every pooled resource. The
//! Composer drives all state transitions through this trait and keeps no
//! state of its own that it could not reconstruct from the broker.
//!
//! Implementations are remote clients and live outside this crate; tests
//! substitute an in-memory fake at this seam. The trait is object-free and
//! the pipeline is generic over it, so implementations pay no boxing cost.
//!
//! All methods may be called concurrently from every pipeline stage.

use crate::resource::{Resource, UserData};
use std::future::Future;
use thiserror::Error;

/// Errors surfaced by a broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No resource matched an acquire. Expected and non-fatal: the calling
    /// stage's own loop is the retry.
    #[error("no resource of type {rtype:?} in state {state:?}")]
    NotFound {
        /// Requested resource type.
        rtype: String,
        /// Requested source state.
        state: String,
    },

    /// An update was asserted against the wrong state.
    #[error("resource {name:?} is not in state {state:?}")]
    Conflict {
        /// Resource the update targeted.
        name: String,
        /// State the caller asserted.
        state: String,
    },

    /// The broker could not be reached or answered with a failure.
    #[error("broker request failed: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Returns true for the expected acquire-miss case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound { .. })
    }
}

/// Client for the external resource broker.
///
/// The five operations the recycling pipeline requires. Semantics the
/// pipeline relies on:
///
/// - [`acquire`](BrokerClient::acquire) atomically selects one resource of
///   the given type in `from_state` and transitions it to `to_state`; a
///   miss is [`BrokerError::NotFound`].
/// - [`acquire_by_state`](BrokerClient::acquire_by_state) is a batch
///   acquire by explicit name set; it returns the subset of `names` that
///   was in `from_state` and silently drops the rest.
/// - [`release_one`](BrokerClient::release_one) is idempotent from the
///   caller's perspective.
/// - [`update_one`](BrokerClient::update_one) asserts the resource is in
///   `state` and merges `user_data`; `None` is a state-only heartbeat.
/// - [`update_all`](BrokerClient::update_all) is a bulk heartbeat, reserved
///   for operators; the pipeline stages do not call it.
pub trait BrokerClient: Send + Sync + 'static {
    /// Acquires one resource of `rtype`, moving it `from_state` -> `to_state`.
    fn acquire(
        &self,
        rtype: &str,
        from_state: &str,
        to_state: &str,
    ) -> impl Future<Output = Result<Resource, BrokerError>> + Send;

    /// Batch acquire by name, moving matches `from_state` -> `to_state`.
    fn acquire_by_state(
        &self,
        from_state: &str,
        to_state: &str,
        names: &[String],
    ) -> impl Future<Output = Result<Vec<Resource>, BrokerError>> + Send;

    /// Transitions the named resource to `to_state`.
    fn release_one(
        &self,
        name: &str,
        to_state: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Asserts `state` and merges `user_data` into the named resource.
    fn update_one(
        &self,
        name: &str,
        state: &str,
        user_data: Option<&UserData>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Bulk heartbeat for every resource held in `state`.
    fn update_all(&self, state: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
