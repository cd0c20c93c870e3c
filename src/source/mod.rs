//! Event source multiplexing
//!
//! Each [`Source`] pairs one change stream with its predicate and owner
//! resolver. Sources run as independent tasks and add resolved keys straight
//! into the shared [`WorkQueue`]. `add` never waits on workers, so a burst on
//! one source cannot hold back another.

mod translator;

pub use translator::{change_stream, ObjectCache, WatchTranslator};

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::change::{ChangeEvent, SourceKind};
use crate::key::EntityKey;
use crate::predicate::EventPredicate;
use crate::queue::WorkQueue;
use crate::resolver::OwnerResolver;
use crate::Error;

/// A source the controller can run without knowing its object type
pub trait EventSource: Send {
    /// Which stream this is
    fn kind(&self) -> SourceKind;

    /// Listen until `cancel` fires or the stream ends
    fn run(self: Box<Self>, queue: Arc<WorkQueue>, cancel: CancellationToken) -> BoxFuture<'static, ()>;
}

/// One registered change stream of objects of kind `K`
pub struct Source<K> {
    kind: SourceKind,
    stream: BoxStream<'static, Result<ChangeEvent<K>, Error>>,
    predicate: Box<dyn EventPredicate<K>>,
    resolver: Box<dyn OwnerResolver<K>>,
}

impl<K> Source<K>
where
    K: Send + Sync + 'static,
{
    /// Register a stream with the predicate and resolver applied to it
    pub fn new<S, P, R>(kind: SourceKind, stream: S, predicate: P, resolver: R) -> Self
    where
        S: Stream<Item = Result<ChangeEvent<K>, Error>> + Send + 'static,
        P: EventPredicate<K> + 'static,
        R: OwnerResolver<K> + 'static,
    {
        Self {
            kind,
            stream: stream.boxed(),
            predicate: Box::new(predicate),
            resolver: Box::new(resolver),
        }
    }

    /// Entity key to enqueue for `event`, if any
    pub fn route(&self, event: &ChangeEvent<K>) -> Option<EntityKey> {
        if !self.predicate.matches(event) {
            trace!(source = %self.kind, change = ?event.change, "Event filtered out");
            return None;
        }
        let key = self.resolver.resolve(event);
        if key.is_none() {
            debug!(source = %self.kind, change = ?event.change, "Event did not resolve to an entity");
        }
        key
    }

    /// Consume the stream, feeding resolved keys into `queue`
    pub async fn listen(mut self, queue: Arc<WorkQueue>, cancel: CancellationToken) {
        debug!(source = %self.kind, "Source started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(source = %self.kind, "Source cancelled");
                    return;
                }
                next = self.stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    if let Some(key) = self.route(&event) {
                        trace!(source = %self.kind, key = %key, "Enqueueing");
                        queue.add(key);
                    }
                }
                Some(Err(e)) => warn!(source = %self.kind, error = %e, "Dropping bad event"),
                None => {
                    info!(source = %self.kind, "Change stream ended, source stopped");
                    return;
                }
            }
        }
    }
}

impl<K> EventSource for Source<K>
where
    K: Send + Sync + 'static,
{
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn run(self: Box<Self>, queue: Arc<WorkQueue>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        Box::pin((*self).listen(queue, cancel))
    }
}
