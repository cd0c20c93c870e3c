//! Import Controller - event intake and dispatch for ManagedCluster import config
//!
//! Watches ManagedClusters and the resources rendered for them, decides which
//! changes matter, maps each change back to the ManagedCluster it belongs to,
//! and drives a reconciler through a deduplicating, retry-aware work queue.
//!
//! # Pipeline
//!
//! ```text
//! watch stream -> translator -> predicate -> resolver -> work queue -> dispatcher -> reconciler
//! ```
//!
//! # Modules
//!
//! - [`crd`] - ManagedCluster Custom Resource Definition
//! - [`change`] - Change events and source kinds
//! - [`key`] - Entity keys naming the unit of work
//! - [`predicate`] - Per-source event filters
//! - [`resolver`] - Mapping events to the owning entity
//! - [`source`] - Watch translation and source multiplexing
//! - [`queue`] - Deduplicating work queue with backoff
//! - [`dispatcher`] - Bounded worker pool
//! - [`reconciler`] - The reconcile seam
//! - [`controller`] - Controller assembly and the import-config wiring
//! - [`config`] - Runtime configuration
//! - [`events`] - Kubernetes Event recording
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod change;
pub mod config;
pub mod controller;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod key;
pub mod predicate;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod source;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name the controller registers under
pub const CONTROLLER_NAME: &str = "importconfig-controller";
