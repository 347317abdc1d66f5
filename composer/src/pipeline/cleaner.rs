//! Cleaner pool: invokes the constructor for fulfilled requests.
//!
//! Construction is the only CPU-variable stage, so it fans out across
//! `cleaner_count` identical workers pulling from the shared *fulfilled*
//! queue. A cleaning failure unwinds the whole compound to dirty; the
//! Recycler will pick the primary up again.

use super::request::Request;
use super::PipelineError;
use crate::broker::BrokerClient;
use crate::registry::ConstructorRegistry;
use crate::resource::state;
use crate::store::ConfigStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) struct Cleaner<C> {
    client: Arc<C>,
    store: Arc<ConfigStore>,
    registry: Arc<ConstructorRegistry>,
    fulfilled: Arc<Mutex<mpsc::Receiver<Request>>>,
    cleaned: mpsc::Sender<Request>,
    worker: usize,
}

impl<C: BrokerClient> Cleaner<C> {
    pub(crate) fn new(
        client: Arc<C>,
        store: Arc<ConfigStore>,
        registry: Arc<ConstructorRegistry>,
        fulfilled: Arc<Mutex<mpsc::Receiver<Request>>>,
        cleaned: mpsc::Sender<Request>,
        worker: usize,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            fulfilled,
            cleaned,
            worker,
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        loop {
            let mut request = {
                let mut fulfilled = self.fulfilled.lock().await;
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!(worker = self.worker, "Cleaner exiting");
                        return;
                    }

                    maybe = fulfilled.recv() => match maybe {
                        Some(request) => request,
                        None => return,
                    },
                }
            };

            match self.clean_one(&mut request).await {
                Ok(()) => {
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => {
                            info!(worker = self.worker, "Cleaner exiting");
                            return;
                        }

                        sent = self.cleaned.send(request) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        resource = %request.resource.name,
                        error = %err,
                        "Cleaning failed, unwinding to dirty"
                    );
                    self.unwind(&request).await;
                }
            }
        }
    }

    /// Builds the constructor for the primary's config and persists the
    /// user data it produces.
    async fn clean_one(&self, request: &mut Request) -> Result<(), PipelineError> {
        let config = self.store.get_config(&request.resource.rtype)?;
        let constructor = self.registry.build(&config.config)?;
        let user_data = constructor.construct(&request.resource, &request.fulfillment)?;

        self.client
            .update_one(
                &request.resource.name,
                &request.resource.state,
                Some(&user_data),
            )
            .await?;
        request.resource.user_data.update(&user_data);
        info!(resource = %request.resource.name, "Resource is cleaned");
        Ok(())
    }

    /// Releases the primary and every leased secondary to dirty. The
    /// secondaries are fully released, so the lease record left on the
    /// primary points at nothing and the next reclaim is a no-op.
    async fn unwind(&self, request: &Request) {
        if let Err(err) = self
            .client
            .release_one(&request.resource.name, state::DIRTY)
            .await
        {
            warn!(resource = %request.resource.name, error = %err, "Unable to release resource");
        }
        for secondary in request.fulfillment.values().flatten() {
            if let Err(err) = self.client.release_one(&secondary.name, state::DIRTY).await {
                warn!(resource = %secondary.name, error = %err, "Unable to release leased resource");
            }
        }
    }
}
