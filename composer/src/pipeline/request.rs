//! In-flight pipeline item.

use crate::resource::{LeasedResources, Resource, ResourceNeeds, TypeToResources};

/// One primary moving through the pipeline, together with what it still
/// needs and what has been leased for it so far.
///
/// A request is owned by exactly one stage at a time; queue hand-off
/// transfers ownership.
#[derive(Debug, Clone)]
pub struct Request {
    /// The primary being recycled. In-memory copy; the broker stays
    /// authoritative.
    pub resource: Resource,

    /// Secondary type -> required count.
    pub needs: ResourceNeeds,

    /// Secondaries leased so far, per type, in acquisition order.
    pub fulfillment: TypeToResources,
}

impl Request {
    /// Creates a request with an empty fulfillment.
    pub fn new(resource: Resource, needs: ResourceNeeds) -> Self {
        Self {
            resource,
            needs,
            fulfillment: TypeToResources::new(),
        }
    }

    /// True iff every needed type is satisfied by exactly the required
    /// number of leased resources. A type absent from the fulfillment map
    /// counts as zero leased.
    pub fn is_fulfilled(&self) -> bool {
        self.needs.iter().all(|(rtype, count)| {
            self.fulfillment.get(rtype).map_or(0, Vec::len) == *count
        })
    }

    /// Flattened names of every leased secondary, in per-type acquisition
    /// order.
    pub fn leased_names(&self) -> LeasedResources {
        self.fulfillment
            .values()
            .flatten()
            .map(|resource| resource.name.clone())
            .collect()
    }
}
