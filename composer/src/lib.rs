//! Composer - recycling pipeline for pooled resources.
//!
//! The Composer turns *dirty* pooled resources back into *free* ones by
//! constructing a compound environment around each. It talks to an external
//! resource broker that owns the authoritative state of every pooled
//! resource; the Composer neither stores resources nor mediates client
//! traffic.
//!
//! # Architecture
//!
//! ```text
//! [Recycler] --pending--> [Fulfiller] --fulfilled--> [Cleaners x N] --cleaned--> [Releaser]
//! ```
//!
//! Each stage is a long-running task connected to its neighbours by bounded
//! queues. The Recycler acquires dirty primaries and dissolves stale leases,
//! the Fulfiller leases the secondary resources each primary's configuration
//! calls for, the Cleaner pool invokes a pluggable [`registry::Constructor`]
//! to describe the assembled compound, and the Releaser returns everything
//! to the broker in the right states.
//!
//! # Example
//!
//! ```ignore
//! use composer::pipeline::{Composer, ComposerConfig};
//!
//! let mut composer = Composer::new(ComposerConfig::default(), client);
//! composer.register_constructor("greeting", factory)?;
//! composer.update_configs("configs.yaml")?;
//!
//! composer.start();
//! // ... run until shutdown ...
//! composer.stop().await;
//! ```

pub mod broker;
pub mod config;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod store;
