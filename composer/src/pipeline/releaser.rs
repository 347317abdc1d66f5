//! Releaser stage: returns a cleaned compound to the broker.
//!
//! The primary goes back to *free*; each leased secondary is parked under
//! a state named after the primary, which is where the next recycle's
//! lease reclaim will look for it.

use super::request::Request;
use crate::broker::BrokerClient;
use crate::resource::{state, LeasedResources, LEASED_RESOURCES};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub(crate) struct Releaser<C> {
    client: Arc<C>,
    cleaned: mpsc::Receiver<Request>,
    sleep_time: Duration,
}

impl<C: BrokerClient> Releaser<C> {
    pub(crate) fn new(
        client: Arc<C>,
        cleaned: mpsc::Receiver<Request>,
        sleep_time: Duration,
    ) -> Self {
        Self {
            client,
            cleaned,
            sleep_time,
        }
    }

    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Releaser exiting");
                    return;
                }

                maybe = self.cleaned.recv() => match maybe {
                    Some(request) => request,
                    None => return,
                },
            };

            if !self.free_primary(&request, &shutdown).await {
                info!("Releaser exiting");
                return;
            }
            self.park_secondaries(&request).await;
        }
    }

    /// Releases the primary to free, retrying until it succeeds.
    ///
    /// Retrying is safe and idempotent: the user data on the primary still
    /// describes the lease, and nothing downstream runs until this call
    /// lands. Returns false when cancelled mid-retry.
    async fn free_primary(&self, request: &Request, shutdown: &CancellationToken) -> bool {
        loop {
            match self
                .client
                .release_one(&request.resource.name, state::FREE)
                .await
            {
                Ok(()) => return true,
                Err(err) => {
                    error!(resource = %request.resource.name, error = %err, "Failed to release resource");
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => return false,

                        _ = tokio::time::sleep(self.sleep_time) => {}
                    }
                }
            }
        }
    }

    /// Parks every leased secondary under the primary's name.
    ///
    /// Errors are collected rather than retried: the primary is already
    /// free, so the request is dropped and any stragglers are repaired by
    /// the next recycle.
    async fn park_secondaries(&self, request: &Request) {
        let leased: LeasedResources = match request.resource.user_data.extract(LEASED_RESOURCES) {
            Ok(names) => names,
            Err(err) => {
                // A request should never get this far without a lease
                // record; drop it and let the next recycle repair.
                error!(resource = %request.resource.name, error = %err, "Failed to extract lease record");
                return;
            }
        };

        let mut failures = 0;
        for name in &leased {
            if let Err(err) = self.client.release_one(name, &request.resource.name).await {
                error!(
                    resource = %name,
                    parking = %request.resource.name,
                    error = %err,
                    "Unable to park leased resource"
                );
                failures += 1;
            }
        }

        if failures > 0 {
            error!(
                resource = %request.resource.name,
                failures,
                total = leased.len(),
                "Some leased resources were not parked"
            );
        } else {
            info!(resource = %request.resource.name, "Resource has been freed");
        }
    }
}
