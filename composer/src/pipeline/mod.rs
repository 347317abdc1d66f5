//! The recycling pipeline and its lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ pending ┌───────────┐ fulfilled ┌──────────────┐ cleaned ┌──────────┐
//! │ Recycler │────────►│ Fulfiller │──────────►│ Cleaners x N │────────►│ Releaser │
//! └──────────┘         └───────────┘           └──────────────┘         └──────────┘
//! ```
//!
//! Three bounded queues connect the stages; producers block when a queue is
//! full, which is the system's backpressure. If the cleaners lag, the
//! Fulfiller blocks on *fulfilled*, which blocks the Recycler on *pending*,
//! which caps how many dirty primaries are pulled from the broker.
//!
//! A single [`CancellationToken`] is broadcast to all stages. Every
//! blocking wait is simultaneously a cancellation point, and no stage
//! drains its input queue on the way out; in-flight compounds stay parked
//! in their current broker state and are repaired by lease reclaim on the
//! next start.

mod cleaner;
mod fulfiller;
mod recycler;
mod releaser;
mod request;

pub use request::Request;

use crate::broker::BrokerClient;
use crate::config::{parse_config, ConfigError};
use crate::registry::{ConstructorFactory, ConstructorRegistry, RegistryError};
use crate::store::{ConfigStore, StoreError};
use cleaner::Cleaner;
use fulfiller::Fulfiller;
use recycler::Recycler;
use releaser::Releaser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default capacity of each hand-off queue.
pub const DEFAULT_CHANNEL_SIZE: usize = 10;

/// Default number of cleaner workers.
pub const DEFAULT_CLEANER_COUNT: usize = 4;

/// Default recycle cadence and per-acquire backoff.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(30);

/// Errors internal to the pipeline stages.
///
/// These never escape the pipeline; each stage's loop decides whether to
/// retry, unwind, or drop the affected request.
#[derive(Debug, Error)]
pub(crate) enum PipelineError {
    #[error("stage cancelled")]
    Cancelled,

    #[error(transparent)]
    Broker(#[from] crate::broker::BrokerError),

    #[error(transparent)]
    UserData(#[from] crate::resource::UserDataError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Construct(#[from] crate::registry::ConstructError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the Composer's configuration surface.
#[derive(Debug, Error)]
pub enum ComposerError {
    /// Loading or parsing the config file failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The parsed set could not be installed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Constructor registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Tunables for a [`Composer`].
#[derive(Debug, Clone)]
pub struct ComposerConfig {
    /// Capacity of each of the three hand-off queues.
    pub channel_size: usize,

    /// Number of cleaner workers. The only parallelism knob.
    pub cleaner_count: usize,

    /// Recycler tick cadence and Fulfiller per-acquire backoff. The two
    /// roles deliberately share one knob.
    pub sleep_time: Duration,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            channel_size: DEFAULT_CHANNEL_SIZE,
            cleaner_count: DEFAULT_CLEANER_COUNT,
            sleep_time: DEFAULT_SLEEP_TIME,
        }
    }
}

/// The recycling worker.
///
/// Owns the stage tasks and the shared collaborators: the broker client,
/// the config store, and the constructor registry. Constructors are
/// registered before [`Composer::start`]; configs may be synced at any
/// time.
pub struct Composer<C> {
    client: Arc<C>,
    store: Arc<ConfigStore>,
    registry: Arc<ConstructorRegistry>,
    config: ComposerConfig,
    cancellation: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl<C: BrokerClient> Composer<C> {
    /// Creates a stopped Composer around a broker client.
    pub fn new(config: ComposerConfig, client: C) -> Self {
        Self {
            client: Arc::new(client),
            store: Arc::new(ConfigStore::new()),
            registry: Arc::new(ConstructorRegistry::new()),
            config,
            cancellation: CancellationToken::new(),
            workers: Vec::new(),
            started: false,
        }
    }

    /// Registers a constructor factory under `tag`.
    ///
    /// Call before [`Composer::start`]; the registry is read-only once the
    /// cleaners are running.
    pub fn register_constructor(
        &self,
        tag: impl Into<String>,
        factory: ConstructorFactory,
    ) -> Result<(), ComposerError> {
        self.registry.register(tag, factory)?;
        Ok(())
    }

    /// Loads the YAML config document at `path` and installs it.
    ///
    /// A parse failure or duplicate name leaves the active set untouched.
    /// May be called before or after [`Composer::start`].
    pub fn update_configs(&self, path: impl AsRef<Path>) -> Result<(), ComposerError> {
        let configs = parse_config(path)?;
        self.store.sync_configs(configs)?;
        Ok(())
    }

    /// Launches every stage and returns immediately.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let (pending_tx, pending_rx) = mpsc::channel(self.config.channel_size);
        let (fulfilled_tx, fulfilled_rx) = mpsc::channel(self.config.channel_size);
        let (cleaned_tx, cleaned_rx) = mpsc::channel(self.config.channel_size);
        let fulfilled_rx = Arc::new(Mutex::new(fulfilled_rx));

        let recycler = Recycler::new(
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            pending_tx,
            self.config.sleep_time,
        );
        self.workers
            .push(tokio::spawn(recycler.run(self.cancellation.clone())));

        let fulfiller = Fulfiller::new(
            Arc::clone(&self.client),
            pending_rx,
            fulfilled_tx,
            self.config.sleep_time,
        );
        self.workers
            .push(tokio::spawn(fulfiller.run(self.cancellation.clone())));

        for worker in 0..self.config.cleaner_count {
            let cleaner = Cleaner::new(
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                Arc::clone(&fulfilled_rx),
                cleaned_tx.clone(),
                worker,
            );
            self.workers
                .push(tokio::spawn(cleaner.run(self.cancellation.clone())));
        }
        drop(cleaned_tx);

        let releaser = Releaser::new(
            Arc::clone(&self.client),
            cleaned_rx,
            self.config.sleep_time,
        );
        self.workers
            .push(tokio::spawn(releaser.run(self.cancellation.clone())));

        info!(
            cleaners = self.config.cleaner_count,
            channel_size = self.config.channel_size,
            "Composer started"
        );
    }

    /// Signals cancellation, waits for every stage to exit, and drops the
    /// queues. Safe to call exactly once; later calls are no-ops.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("Stopping composer");
        self.cancellation.cancel();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
        info!("Composer stopped");
    }
}
