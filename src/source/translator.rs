//! Translation of raw watch notifications into change events
//!
//! A Kubernetes watch only reports "this object now looks like X" or "this
//! object is gone". The predicates need to know whether an apply is a create
//! or an update and what the object looked like before, so the translator
//! remembers the last observed state of every object in an [`ObjectCache`].
//!
//! A relist (`Init` .. `InitDone`) re-applies every live object. Objects that
//! were known before the relist but not re-applied during it were deleted
//! while the watch was down and are reported as deletes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use tracing::trace;

use crate::change::{ChangeEvent, SourceKind};
use crate::key::EntityKey;
use crate::Error;

/// Last observed state of every object on one source
///
/// Cheap to clone; clones share the same storage.
#[derive(Debug)]
pub struct ObjectCache<K> {
    objects: Arc<RwLock<HashMap<EntityKey, Arc<K>>>>,
}

impl<K> Clone for ObjectCache<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> ObjectCache<K> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Last observed state of `key`
    pub fn get(&self, key: &EntityKey) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    /// Number of remembered objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True when nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: EntityKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.objects.write().insert(key, obj)
    }

    fn remove(&self, key: &EntityKey) -> Option<Arc<K>> {
        self.objects.write().remove(key)
    }

    /// Remove and return every entry whose key is not in `keep`
    fn retain_only(&self, keep: &HashSet<EntityKey>) -> Vec<Arc<K>> {
        let mut objects = self.objects.write();
        let gone: Vec<EntityKey> = objects
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        gone.iter().filter_map(|k| objects.remove(k)).collect()
    }
}

/// Stateful converter from `watcher::Event` to [`ChangeEvent`]
pub struct WatchTranslator<K> {
    source: SourceKind,
    cache: ObjectCache<K>,
    /// Identities re-applied since the last `Init`, while a relist runs
    relist: Option<HashSet<EntityKey>>,
}

impl<K> WatchTranslator<K>
where
    K: Resource + Clone,
{
    /// Create a translator for `source` remembering objects in `cache`
    pub fn new(source: SourceKind, cache: ObjectCache<K>) -> Self {
        Self {
            source,
            cache,
            relist: None,
        }
    }

    /// Cache shared with owner lookups
    pub fn cache(&self) -> &ObjectCache<K> {
        &self.cache
    }

    /// Translate one watch notification into zero or more change events
    pub fn translate(&mut self, event: watcher::Event<K>) -> Vec<Result<ChangeEvent<K>, Error>> {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => vec![self.delete(obj)],
            watcher::Event::Init => {
                trace!(source = %self.source, "Relist started");
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let (Some(seen), Some(key)) = (self.relist.as_mut(), EntityKey::for_object(&obj)) {
                    seen.insert(key);
                }
                self.apply(obj).into_iter().collect()
            }
            watcher::Event::InitDone => self.finish_relist(),
        }
    }

    fn apply(&mut self, obj: K) -> Option<Result<ChangeEvent<K>, Error>> {
        let Some(key) = EntityKey::for_object(&obj) else {
            return Some(Err(self.malformed()));
        };
        let obj = Arc::new(obj);
        let previous = self.cache.insert(key.clone(), Arc::clone(&obj));
        match previous {
            None => Some(Ok(ChangeEvent::created(self.source, obj))),
            Some(prev) if unchanged(prev.as_ref(), obj.as_ref()) => {
                trace!(source = %self.source, key = %key, "Resource version unchanged, skipping");
                None
            }
            Some(prev) => Some(Ok(ChangeEvent::updated(self.source, Some(prev), obj))),
        }
    }

    fn delete(&mut self, obj: K) -> Result<ChangeEvent<K>, Error> {
        let key = EntityKey::for_object(&obj).ok_or_else(|| self.malformed())?;
        let remembered = self.cache.remove(&key);
        let last = Arc::new(obj);
        Ok(ChangeEvent {
            previous: remembered.or_else(|| Some(Arc::clone(&last))),
            ..ChangeEvent::deleted(self.source, last)
        })
    }

    fn finish_relist(&mut self) -> Vec<Result<ChangeEvent<K>, Error>> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let gone = self.cache.retain_only(&seen);
        trace!(source = %self.source, live = seen.len(), gone = gone.len(), "Relist finished");
        gone.into_iter()
            .map(|obj| Ok(ChangeEvent::deleted(self.source, obj)))
            .collect()
    }

    fn malformed(&self) -> Error {
        Error::malformed_event(self.source.as_str(), "object has no metadata.name")
    }
}

/// Same resource version on both sides means nothing changed
fn unchanged<K: Resource>(previous: &K, current: &K) -> bool {
    match (previous.resource_version(), current.resource_version()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Adapt a raw watch stream into a stream of change events
///
/// Watch errors are passed through as [`Error::Watch`]; the underlying
/// watcher retries on its own.
pub fn change_stream<K, S, E>(
    source: SourceKind,
    watch: S,
    cache: ObjectCache<K>,
) -> impl Stream<Item = Result<ChangeEvent<K>, Error>> + Send
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Stream<Item = Result<watcher::Event<K>, E>> + Send,
    E: std::fmt::Display,
{
    let mut translator = WatchTranslator::new(source, cache);
    watch.flat_map(move |item| {
        let events = match item {
            Ok(event) => translator.translate(event),
            Err(e) => vec![Err(Error::watch(source.as_str(), e.to_string()))],
        };
        stream::iter(events)
    })
}
