//! Controller assembly
//!
//! A [`Controller`] owns the work queue, the registered sources and the
//! dispatcher. It is built explicitly through [`ControllerBuilder`]; nothing
//! is registered globally.
//!
//! ```ignore
//! let controller = Controller::builder(CONTROLLER_NAME)
//!     .concurrency(10)
//!     .source(managed_clusters)
//!     .source(cluster_role_bindings)
//!     .reconciler(Arc::new(reconciler))
//!     .build()?;
//! controller.run(cancel).await;
//! ```

pub mod importconfig;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ControllerConfig, DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_CONCURRENT_RECONCILES};
use crate::crd::ManagedCluster;
use crate::dispatcher::{Dispatcher, ReferenceFn};
use crate::events::{object_reference, EventPublisher, NoopEventPublisher};
use crate::queue::{BackoffPolicy, WorkQueue};
use crate::reconciler::Reconciler;
use crate::source::EventSource;
use crate::{Error, Result};

/// A fully wired intake and dispatch pipeline
pub struct Controller {
    name: String,
    queue: Arc<WorkQueue>,
    sources: Vec<Box<dyn EventSource>>,
    dispatcher: Dispatcher,
}

impl Controller {
    /// Start building a controller registered under `name`
    pub fn builder(name: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(name)
    }

    /// Registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared work queue
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Number of registered sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Run every source and the worker pool until `cancel` fires
    ///
    /// Returns after the dispatcher has drained and all sources stopped.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            controller = %self.name,
            sources = self.sources.len(),
            workers = self.dispatcher.concurrency(),
            "Starting controller"
        );

        let sources_cancel = cancel.child_token();
        let mut listeners = JoinSet::new();
        for source in self.sources {
            info!(controller = %self.name, source = %source.kind(), "Starting source");
            listeners.spawn(source.run(Arc::clone(&self.queue), sources_cancel.clone()));
        }

        self.dispatcher.run(cancel).await;

        sources_cancel.cancel();
        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.name, error = %e, "Source task failed");
            }
        }
        info!(controller = %self.name, pending = self.queue.len(), "Controller stopped");
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    name: String,
    concurrency: usize,
    backoff: BackoffPolicy,
    drain_timeout: Duration,
    sources: Vec<Box<dyn EventSource>>,
    reconciler: Option<Arc<dyn Reconciler>>,
    events: Option<Arc<dyn EventPublisher>>,
    reference: Option<ReferenceFn>,
}

impl ControllerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: DEFAULT_MAX_CONCURRENT_RECONCILES,
            backoff: BackoffPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            sources: Vec::new(),
            reconciler: None,
            events: None,
            reference: None,
        }
    }

    /// Take worker count, backoff and drain timeout from `config`
    pub fn with_config(self, config: &ControllerConfig) -> Self {
        self.concurrency(config.max_concurrent_reconciles)
            .backoff(config.backoff)
            .drain_timeout(config.drain_timeout)
    }

    /// Set the number of workers
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    /// Set the retry policy for failed reconciles
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set how long in-flight reconciles may run after cancellation
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Register a source
    pub fn source(mut self, source: impl EventSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Register an already boxed source
    pub fn boxed_source(mut self, source: Box<dyn EventSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Set the reconciler (required)
    pub fn reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Set the event publisher used for terminal errors
    ///
    /// Defaults to [`NoopEventPublisher`].
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set how keys map to the objects events are recorded on
    ///
    /// Defaults to ManagedCluster references.
    pub fn entity_reference(mut self, reference: ReferenceFn) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Build the controller
    pub fn build(self) -> Result<Controller> {
        if self.name.is_empty() {
            return Err(Error::validation("name", "must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(Error::validation("max_concurrent_reconciles", "must be at least 1"));
        }
        let reconciler = self
            .reconciler
            .ok_or_else(|| Error::validation("reconciler", "a reconciler is required"))?;

        let queue = Arc::new(WorkQueue::new(self.backoff));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            reconciler,
            self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            self.reference
                .unwrap_or_else(|| Arc::new(object_reference::<ManagedCluster>)),
            self.concurrency,
            self.drain_timeout,
        );

        Ok(Controller {
            name: self.name,
            queue,
            sources: self.sources,
            dispatcher,
        })
    }
}
