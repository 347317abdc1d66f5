//! Fulfiller stage: leases secondaries until a request's needs are met.
//!
//! Requests are processed serially; the per-type acquire loop sleeps
//! between attempts, which is the only backoff against the broker. While
//! waiting, every resource already attached to the request is refreshed so
//! the broker does not reap it as abandoned.

use super::request::Request;
use super::PipelineError;
use crate::broker::BrokerClient;
use crate::resource::{state, UserData, LEASED_RESOURCES};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Fulfiller<C> {
    client: Arc<C>,
    pending: mpsc::Receiver<Request>,
    fulfilled: mpsc::Sender<Request>,
    sleep_time: Duration,
}

impl<C: BrokerClient> Fulfiller<C> {
    pub(crate) fn new(
        client: Arc<C>,
        pending: mpsc::Receiver<Request>,
        fulfilled: mpsc::Sender<Request>,
        sleep_time: Duration,
    ) -> Self {
        Self {
            client,
            pending,
            fulfilled,
            sleep_time,
        }
    }

    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let mut request = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Fulfiller exiting");
                    return;
                }

                maybe = self.pending.recv() => match maybe {
                    Some(request) => request,
                    None => return,
                },
            };

            match self.fulfill_one(&mut request, &shutdown).await {
                Ok(()) => {
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => {
                            info!("Fulfiller exiting");
                            return;
                        }

                        sent = self.fulfilled.send(request) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(PipelineError::Cancelled) => {
                    // Leave partial leases in place: the recorded lease
                    // names let the next recycle of this primary reclaim
                    // them, and skipping the releases bounds stop latency.
                    info!("Fulfiller exiting");
                    return;
                }
                Err(err) => {
                    // Give back whatever was leased; the primary stays in
                    // cleaning and is repaired by the next recycle.
                    self.abandon(&request).await;
                    warn!(resource = %request.resource.name, error = %err, "Failed to fulfill request");
                }
            }
        }
    }

    /// Leases secondaries until the request is fulfilled, then persists the
    /// lease association on the primary.
    async fn fulfill_one(
        &self,
        request: &mut Request,
        shutdown: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut needs = request.needs.clone();
        let types: Vec<String> = needs.keys().cloned().collect();

        for rtype in types {
            while needs.get(&rtype).copied().unwrap_or(0) > 0 {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return Err(PipelineError::Cancelled),

                    _ = tokio::time::sleep(self.sleep_time) => {}
                }

                // A long wait here must not look like abandonment.
                self.refresh_resources(request).await;

                match self.client.acquire(&rtype, state::FREE, state::LEASED).await {
                    Ok(secondary) => {
                        request
                            .fulfillment
                            .entry(rtype.clone())
                            .or_default()
                            .push(secondary);
                        if let Some(count) = needs.get_mut(&rtype) {
                            *count -= 1;
                        }
                        // Record the partial lease set immediately, so an
                        // interrupted fulfillment leaves a trail the next
                        // recycle can reclaim from.
                        self.persist_leases(request).await?;
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(rtype = %rtype, "No free secondary to lease");
                    }
                    Err(err) => {
                        debug!(rtype = %rtype, error = %err, "Broker acquire failed");
                    }
                }
            }
        }

        if !request.is_fulfilled() {
            return Err(PipelineError::Internal(format!(
                "request for {} left the acquire loop unfulfilled",
                request.resource.name
            )));
        }

        self.persist_leases(request).await?;
        info!(resource = %request.resource.name, "Requirements fulfilled");
        Ok(())
    }

    /// Writes the current lease list into the primary's user data, on the
    /// broker and in the in-memory copy.
    async fn persist_leases(&self, request: &mut Request) -> Result<(), PipelineError> {
        let mut user_data = UserData::new();
        user_data.set(LEASED_RESOURCES, &request.leased_names())?;
        self.client
            .update_one(
                &request.resource.name,
                &request.resource.state,
                Some(&user_data),
            )
            .await?;
        request.resource.user_data.update(&user_data);
        Ok(())
    }

    /// State-only heartbeat for the primary and every leased secondary.
    async fn refresh_resources(&self, request: &Request) {
        let secondaries = request.fulfillment.values().flatten();
        for resource in std::iter::once(&request.resource).chain(secondaries) {
            if let Err(err) = self
                .client
                .update_one(&resource.name, &resource.state, None)
                .await
            {
                warn!(resource = %resource.name, error = %err, "Failed to refresh resource");
            }
        }
    }

    /// Returns every leased secondary to free and clears the recorded
    /// lease, so nothing points at resources that are back in the pool.
    /// Not used on cancellation, where partial leases are deliberately
    /// left for reclaim.
    async fn abandon(&self, request: &Request) {
        for secondary in request.fulfillment.values().flatten() {
            match self.client.release_one(&secondary.name, state::FREE).await {
                Ok(()) => info!(resource = %secondary.name, "Released resource"),
                Err(err) => {
                    warn!(resource = %secondary.name, error = %err, "Failed to release resource");
                }
            }
        }

        if request.resource.user_data.contains_key(LEASED_RESOURCES) {
            let clear = UserData::tombstone(LEASED_RESOURCES);
            if let Err(err) = self
                .client
                .update_one(
                    &request.resource.name,
                    &request.resource.state,
                    Some(&clear),
                )
                .await
            {
                warn!(resource = %request.resource.name, error = %err, "Failed to clear lease entry");
            }
        }
    }
}
