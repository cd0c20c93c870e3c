//! Worker pool draining the work queue into the reconciler
//!
//! Each worker leases one key at a time, so the queue's single-flight rule is
//! what keeps a key from being reconciled twice at once. The number of
//! workers is the concurrency limit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::events::{actions, reasons, EventPublisher};
use crate::key::EntityKey;
use crate::queue::{Lease, WorkQueue};
use crate::reconciler::Reconciler;
use crate::Error;

/// Maps an entity key to the object that Kubernetes events are recorded on
pub type ReferenceFn = Arc<dyn Fn(&EntityKey) -> ObjectReference + Send + Sync>;

/// Bounded pool of reconcile workers
pub struct Dispatcher {
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    events: Arc<dyn EventPublisher>,
    reference: ReferenceFn,
    concurrency: usize,
    drain_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher; `concurrency` is raised to 1 if zero
    pub fn new(
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn Reconciler>,
        events: Arc<dyn EventPublisher>,
        reference: ReferenceFn,
        concurrency: usize,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            reconciler,
            events,
            reference,
            concurrency: concurrency.max(1),
            drain_timeout,
        }
    }

    /// Number of workers
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run workers until `cancel` fires, then drain
    ///
    /// On cancellation the queue is shut down so idle workers exit. Workers
    /// busy with a reconcile get `drain_timeout` to finish; the rest are
    /// aborted and their keys return to pending.
    pub async fn run(self, cancel: CancellationToken) {
        let this = Arc::new(self);
        let mut workers = JoinSet::new();
        for id in 0..this.concurrency {
            workers.spawn(Arc::clone(&this).worker(id));
        }
        let mut next_id = this.concurrency;
        info!(workers = this.concurrency, "Dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(Err(e)) => {
                        error!(error = %e, worker = next_id, "Worker task failed, respawning");
                        workers.spawn(Arc::clone(&this).worker(next_id));
                        next_id += 1;
                    }
                    Some(Ok(())) => {}
                    None => {
                        info!("All workers exited");
                        return;
                    }
                },
            }
        }

        this.queue.shut_down();
        let in_flight = this.queue.in_flight();
        info!(in_flight, timeout_secs = this.drain_timeout.as_secs(), "Draining workers");

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task failed while draining");
                }
            }
        };
        if tokio::time::timeout(this.drain_timeout, drain).await.is_err() {
            warn!(
                in_flight = this.queue.in_flight(),
                "Drain timeout reached, aborting remaining reconciles"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        info!("Dispatcher stopped");
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "Worker started");
        while let Some(lease) = self.queue.lease().await {
            self.process(lease).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    #[instrument(skip(self, lease), fields(key = %lease.key()))]
    async fn process(&self, lease: Lease) {
        let key = lease.key().clone();
        let outcome = AssertUnwindSafe(async { self.reconciler.reconcile(&key).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::internal_with_context("dispatcher", "reconcile panicked")));

        match outcome {
            Ok(action) => match action.requeue_after() {
                Some(delay) => {
                    debug!(delay_secs = delay.as_secs(), "Reconciled, rechecking later");
                    lease.requeue_after(delay);
                }
                None => {
                    debug!("Reconciled");
                    lease.done(true);
                }
            },
            Err(e) if e.is_retryable() => {
                let attempts = self.queue.attempts(&key).unwrap_or(0).saturating_add(1);
                warn!(error = %e, attempts, "Reconcile failed, retrying with backoff");
                lease.done(false);
            }
            Err(e) => {
                error!(error = %e, "Reconcile failed with terminal error");
                lease.done(true);
                let reference = (self.reference)(&key);
                self.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::RECONCILE_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
        }
    }
}
