//! Recycler stage: turns dirty primaries into pending requests.
//!
//! On every tick the Recycler snapshots the active configs, tries to
//! acquire one dirty primary per config, dissolves any stale lease the
//! primary carries from a previous life, and pushes a fresh [`Request`]
//! onto the *pending* queue. The tick fires `sleep_time` after the
//! previous iteration finished, so a slow broker stretches the cadence
//! instead of stacking iterations.

use super::request::Request;
use super::PipelineError;
use crate::broker::BrokerClient;
use crate::resource::{state, LeasedResources, Resource, UserData, LEASED_RESOURCES};
use crate::store::ConfigStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Recycler<C> {
    client: Arc<C>,
    store: Arc<ConfigStore>,
    pending: mpsc::Sender<Request>,
    sleep_time: Duration,
}

impl<C: BrokerClient> Recycler<C> {
    pub(crate) fn new(
        client: Arc<C>,
        store: Arc<ConfigStore>,
        pending: mpsc::Sender<Request>,
        sleep_time: Duration,
    ) -> Self {
        Self {
            client,
            store,
            pending,
            sleep_time,
        }
    }

    /// Runs until cancellation. Every blocking wait doubles as a
    /// cancellation point; the input queue is never drained on exit.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Recycler exiting");
                    return;
                }

                _ = tokio::time::sleep(self.sleep_time) => {}
            }

            for config in self.store.get_configs() {
                let mut primary = match self
                    .client
                    .acquire(&config.rtype, state::DIRTY, state::CLEANING)
                    .await
                {
                    Ok(resource) => resource,
                    Err(err) if err.is_not_found() => {
                        debug!(rtype = %config.rtype, "No dirty primary to acquire");
                        continue;
                    }
                    Err(err) => {
                        warn!(rtype = %config.rtype, error = %err, "Broker acquire failed");
                        continue;
                    }
                };

                match self.recycle_one(&mut primary).await {
                    Ok(request) => {
                        tokio::select! {
                            biased;

                            _ = shutdown.cancelled() => {
                                info!("Recycler exiting");
                                return;
                            }

                            sent = self.pending.send(request) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(resource = %primary.name, error = %err, "Unable to recycle resource");
                        if let Err(err) =
                            self.client.release_one(&primary.name, state::DIRTY).await
                        {
                            warn!(resource = %primary.name, error = %err, "Unable to release resource");
                        }
                    }
                }
            }
        }
    }

    /// Prepares one freshly acquired dirty primary for re-fulfillment.
    async fn recycle_one(&self, primary: &mut Resource) -> Result<Request, PipelineError> {
        info!(resource = %primary.name, "Resource is being recycled");
        let config = self.store.get_config(&primary.rtype)?;

        match primary.user_data.extract::<LeasedResources>(LEASED_RESOURCES) {
            Ok(stale) => self.reclaim_lease(primary, &stale).await,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Request::new(primary.clone(), config.needs))
    }

    /// Dissolves a lease recorded in a previous life of this primary.
    ///
    /// Secondaries still parked under the primary's name are pulled out
    /// first; then every recorded name is released to dirty so orphans
    /// stranded in *leased* by an interrupted fulfillment are recovered
    /// too. Partial failures are logged and skipped: the names stay in
    /// user data until the clear succeeds, so the next recycle retries.
    async fn reclaim_lease(&self, primary: &mut Resource, stale: &[String]) {
        match self
            .client
            .acquire_by_state(&primary.name, state::LEASED, stale)
            .await
        {
            Ok(parked) => {
                debug!(
                    resource = %primary.name,
                    count = parked.len(),
                    "Pulled parked secondaries out of parking"
                );
            }
            Err(err) => {
                warn!(resource = %primary.name, error = %err, "Could not acquire leased resources");
            }
        }

        for name in stale {
            if let Err(err) = self.client.release_one(name, state::DIRTY).await {
                warn!(resource = %name, error = %err, "Could not release resource");
            }
        }

        primary.user_data.remove(LEASED_RESOURCES);
        let clear = UserData::tombstone(LEASED_RESOURCES);
        if let Err(err) = self
            .client
            .update_one(&primary.name, &primary.state, Some(&clear))
            .await
        {
            // Stale names survive on the broker side; the next recycle of
            // this primary reclaims against names that no longer resolve,
            // which is safe.
            warn!(resource = %primary.name, error = %err, "Could not clear stale lease entry");
        }
    }
}
