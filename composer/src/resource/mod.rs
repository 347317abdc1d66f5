//! Core data model for pooled resources.
//!
//! A [`Resource`] is an opaque record owned by the broker. The Composer
//! mutates only its state tag and its user-data bag, and only through the
//! broker client. Everything else here is bookkeeping for one in-flight
//! recycling request: which secondary types a primary needs
//! ([`ResourceNeeds`]) and which concrete resources currently satisfy those
//! slots ([`TypeToResources`]).

mod user_data;

pub use user_data::{UserData, UserDataError, LEASED_RESOURCES};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known lifecycle state tags.
///
/// Beyond these, a resource can sit in an arbitrary *parking* state named
/// after a primary resource, which is how leased secondaries are held
/// between fulfillment and the next recycle.
pub mod state {
    /// Ready for hand-out.
    pub const FREE: &str = "free";
    /// Needs recycling before it can be handed out again.
    pub const DIRTY: &str = "dirty";
    /// Held by the Composer while a compound is being rebuilt.
    pub const CLEANING: &str = "cleaning";
    /// Temporarily associated with a primary as a secondary.
    pub const LEASED: &str = "leased";
}

/// A pooled resource as the broker sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique name, assigned by the broker.
    pub name: String,

    /// Resource type tag.
    #[serde(rename = "type")]
    pub rtype: String,

    /// Current lifecycle state tag.
    pub state: String,

    /// Opaque string-keyed payload persisted alongside the resource.
    #[serde(default)]
    pub user_data: UserData,
}

impl Resource {
    /// Creates a resource in the given state with empty user data.
    pub fn new(
        name: impl Into<String>,
        rtype: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rtype: rtype.into(),
            state: state.into(),
            user_data: UserData::new(),
        }
    }
}

/// Required secondary count per resource type for one primary.
pub type ResourceNeeds = BTreeMap<String, usize>;

/// Concrete resources currently satisfying each type slot of a request.
pub type TypeToResources = BTreeMap<String, Vec<Resource>>;

/// Flattened, ordered list of leased secondary names.
///
/// Persisted in a primary's user data under [`LEASED_RESOURCES`] so lease
/// relationships can be recovered from the broker's view alone.
pub type LeasedResources = Vec<String>;
