//! Deduplicating, retry-aware work queue
//!
//! Holds at most one entry per [`EntityKey`]. An entry is either pending
//! (waiting to become eligible) or in flight (handed to a worker). Adding a
//! pending key is a no-op; adding an in-flight key marks it for a single
//! re-add once the current attempt completes. Failed attempts are rescheduled
//! with [`BackoffPolicy`] delays.
//!
//! Eligible keys are handed out in enqueue order. The internal state is the
//! only shared mutable state of the controller and sits behind one mutex that
//! is never held across an await point.

mod backoff;

pub use backoff::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::key::EntityKey;

/// Snapshot of one queue entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    /// Entity the entry is for
    pub key: EntityKey,
    /// When the entry was (re)inserted as pending
    pub enqueued_at: Instant,
    /// Consecutive failed attempts
    pub attempts: u32,
    /// Earliest time the key may be handed out; `None` while in flight
    pub next_eligible: Option<Instant>,
    /// Whether a worker currently holds the key
    pub in_flight: bool,
    /// Whether an add arrived while in flight
    pub requeue_pending: bool,
}

#[derive(Debug)]
enum EntryState {
    Pending { not_before: Instant },
    InFlight { requeue: bool },
}

#[derive(Debug)]
struct Entry {
    attempts: u32,
    enqueued_at: Instant,
    state: EntryState,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<EntityKey, Entry>,
    /// Eligible pending keys by enqueue sequence
    ready: BTreeMap<u64, EntityKey>,
    /// Pending keys waiting for their backoff to expire
    delayed: BinaryHeap<Reverse<(Instant, u64, EntityKey)>>,
    next_seq: u64,
    shut_down: bool,
}

impl QueueState {
    /// Insert or overwrite `key` as pending, eligible at `not_before`
    fn schedule(&mut self, key: EntityKey, attempts: u32, not_before: Instant, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if not_before <= now {
            self.ready.insert(seq, key.clone());
        } else {
            self.delayed.push(Reverse((not_before, seq, key.clone())));
        }
        self.entries.insert(
            key,
            Entry {
                attempts,
                enqueued_at: now,
                state: EntryState::Pending { not_before },
            },
        );
    }

    /// Move delayed keys whose backoff expired into the ready set
    fn promote(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse((at, _, _))| *at <= now)
        {
            if let Some(Reverse((_, seq, key))) = self.delayed.pop() {
                self.ready.insert(seq, key);
            }
        }
    }

    /// Take the oldest eligible key and mark it in flight
    fn pop_ready(&mut self) -> Option<EntityKey> {
        let (_, key) = self.ready.pop_first()?;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.state = EntryState::InFlight { requeue: false };
        }
        Some(key)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Attempts and re-add flag of `key` if it is in flight
    fn take_in_flight(&mut self, key: &EntityKey) -> Option<(u32, bool)> {
        match self.entries.get(key) {
            Some(Entry {
                attempts,
                state: EntryState::InFlight { requeue },
                ..
            }) => Some((*attempts, *requeue)),
            _ => None,
        }
    }
}

/// Deduplicating work queue of entity keys
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl WorkQueue {
    /// Create an empty queue with the given retry policy
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Retry policy used for failed keys
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Enqueue `key`
    ///
    /// Creates an immediately eligible entry if the key is unknown. A pending
    /// key is left untouched; an in-flight key is re-added once after its
    /// current attempt finishes. Ignored after shutdown.
    pub fn add(&self, key: EntityKey) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                debug!(key = %key, "Queue shut down, dropping add");
                return;
            }
            if let Some(entry) = state.entries.get_mut(&key) {
                match &mut entry.state {
                    EntryState::Pending { .. } => trace!(key = %key, "Key already pending"),
                    EntryState::InFlight { requeue } => {
                        trace!(key = %key, "Key in flight, coalescing re-add");
                        *requeue = true;
                    }
                }
                return;
            }
            let now = Instant::now();
            state.schedule(key, 0, now, now);
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next eligible key and mark it in flight
    ///
    /// Returns `None` once the queue is shut down. Cancel safe: a key is only
    /// marked in flight in the same poll that returns it.
    pub async fn get(&self) -> Option<EntityKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return None;
                }
                state.promote(Instant::now());
                if let Some(key) = state.pop_ready() {
                    return Some(key);
                }
                state.next_deadline()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Like [`WorkQueue::get`], wrapping the key in a [`Lease`]
    pub async fn lease(self: &Arc<Self>) -> Option<Lease> {
        let key = self.get().await?;
        Some(Lease {
            queue: Arc::clone(self),
            key,
            completed: false,
        })
    }

    /// Finish processing of an in-flight key
    ///
    /// On success the entry is removed, or reinserted with a fresh attempt
    /// count if an add arrived meanwhile. On failure the attempt count grows
    /// and the key becomes eligible again after the backoff delay.
    pub fn done(&self, key: &EntityKey, success: bool) {
        {
            let mut state = self.state.lock();
            let Some((attempts, requeue)) = state.take_in_flight(key) else {
                warn!(key = %key, "done() for a key that is not in flight");
                return;
            };
            let now = Instant::now();
            if success {
                if requeue {
                    state.schedule(key.clone(), 0, now, now);
                } else {
                    state.entries.remove(key);
                }
            } else {
                let attempts = attempts.saturating_add(1);
                let delay = self.backoff.delay(attempts);
                debug!(key = %key, attempts, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
                state.schedule(key.clone(), attempts, now + delay, now);
            }
        }
        self.notify.notify_waiters();
    }

    /// Finish an in-flight key successfully but look at it again after `delay`
    ///
    /// Resets the attempt count. A re-add that arrived while in flight makes
    /// the key eligible immediately.
    pub fn requeue_after(&self, key: &EntityKey, delay: Duration) {
        {
            let mut state = self.state.lock();
            let Some((_, requeue)) = state.take_in_flight(key) else {
                warn!(key = %key, "requeue_after() for a key that is not in flight");
                return;
            };
            let now = Instant::now();
            let not_before = if requeue { now } else { now + delay };
            state.schedule(key.clone(), 0, not_before, now);
        }
        self.notify.notify_waiters();
    }

    /// Return an in-flight key to pending without counting an attempt
    ///
    /// Used when a worker is cancelled mid-processing.
    pub fn release(&self, key: &EntityKey) {
        {
            let mut state = self.state.lock();
            let Some((attempts, _)) = state.take_in_flight(key) else {
                return;
            };
            let now = Instant::now();
            state.schedule(key.clone(), attempts, now, now);
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out keys and wake every waiting [`WorkQueue::get`]
    ///
    /// In-flight keys can still be completed afterwards.
    pub fn shut_down(&self) {
        self.state.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Number of entries, pending or in flight
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when no entries exist
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e.state, EntryState::InFlight { .. }))
            .count()
    }

    /// Consecutive failed attempts for `key`, if it has an entry
    pub fn attempts(&self, key: &EntityKey) -> Option<u32> {
        self.state.lock().entries.get(key).map(|e| e.attempts)
    }

    /// Snapshot of the entry for `key`
    pub fn entry(&self, key: &EntityKey) -> Option<QueueEntry> {
        let state = self.state.lock();
        let entry = state.entries.get(key)?;
        let (next_eligible, in_flight, requeue_pending) = match entry.state {
            EntryState::Pending { not_before } => (Some(not_before), false, false),
            EntryState::InFlight { requeue } => (None, true, requeue),
        };
        Some(QueueEntry {
            key: key.clone(),
            enqueued_at: entry.enqueued_at,
            attempts: entry.attempts,
            next_eligible,
            in_flight,
            requeue_pending,
        })
    }
}

/// An in-flight key handed to a worker
///
/// Dropping a lease without completing it returns the key to pending, so a
/// cancelled worker never loses its key.
#[derive(Debug)]
pub struct Lease {
    queue: Arc<WorkQueue>,
    key: EntityKey,
    completed: bool,
}

impl Lease {
    /// The leased key
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Complete with [`WorkQueue::done`]
    pub fn done(mut self, success: bool) {
        self.completed = true;
        self.queue.done(&self.key, success);
    }

    /// Complete with [`WorkQueue::requeue_after`]
    pub fn requeue_after(mut self, delay: Duration) {
        self.completed = true;
        self.queue.requeue_after(&self.key, delay);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.completed {
            debug!(key = %self.key, "Lease dropped before completion, returning key to queue");
            self.queue.release(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> EntityKey {
        EntityKey::cluster_scoped(name)
    }

    /// Paused-clock timers fire on millisecond ticks, so allow a little slack
    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "expected ~{:?}, got {:?}",
            expected,
            elapsed
        );
    }

    async fn get_now(queue: &WorkQueue) -> Option<EntityKey> {
        tokio::time::timeout(Duration::from_millis(1), queue.get())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn add_then_get_returns_key_and_marks_in_flight() {
        let queue = WorkQueue::default();
        queue.add(key("east-1"));

        assert_eq!(queue.get().await, Some(key("east-1")));
        assert_eq!(queue.in_flight(), 1);
        assert!(queue.entry(&key("east-1")).unwrap().in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_adds_while_pending_collapse() {
        let queue = WorkQueue::default();
        for _ in 0..50 {
            queue.add(key("east-1"));
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("east-1")));
        assert_eq!(get_now(&queue).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_come_out_in_enqueue_order() {
        let queue = WorkQueue::default();
        for name in ["c", "a", "b"] {
            queue.add(key(name));
        }
        queue.add(key("a"));
        assert_eq!(queue.get().await, Some(key("c")));
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_key_is_not_handed_out_twice() {
        let queue = WorkQueue::default();
        queue.add(key("east-1"));
        let first = queue.get().await.unwrap();

        queue.add(key("east-1"));
        queue.add(key("east-1"));
        assert_eq!(get_now(&queue).await, None);
        assert_eq!(queue.len(), 1);
        assert!(queue.entry(&first).unwrap().requeue_pending);

        queue.done(&first, true);
        assert_eq!(queue.get().await, Some(key("east-1")));
        queue.done(&first, true);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn success_removes_entry() {
        let queue = WorkQueue::default();
        queue.add(key("east-1"));
        let k = queue.get().await.unwrap();
        queue.done(&k, true);
        assert!(queue.is_empty());
        assert_eq!(get_now(&queue).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_delays_by_backoff_and_counts_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let queue = WorkQueue::new(policy);
        queue.add(key("east-1"));

        let k = queue.get().await.unwrap();
        queue.done(&k, false);
        assert_eq!(queue.attempts(&k), Some(1));

        let start = Instant::now();
        assert_eq!(queue.get().await, Some(k.clone()));
        assert_elapsed(start, Duration::from_secs(1));

        queue.done(&k, false);
        let start = Instant::now();
        assert_eq!(queue.get().await, Some(k.clone()));
        assert_elapsed(start, Duration::from_secs(2));
        assert_eq!(queue.attempts(&k), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn add_while_backing_off_keeps_the_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(60));
        let queue = WorkQueue::new(policy);
        queue.add(key("east-1"));
        let k = queue.get().await.unwrap();
        queue.done(&k, false);

        queue.add(key("east-1"));
        assert_eq!(queue.len(), 1);
        assert_eq!(get_now(&queue).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_coalesced_add_resets_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let queue = WorkQueue::new(policy);
        queue.add(key("east-1"));
        let k = queue.get().await.unwrap();
        queue.done(&k, false);
        let k = queue.get().await.unwrap();

        queue.add(k.clone());
        queue.done(&k, true);
        let entry = queue.entry(&k).unwrap();
        assert_eq!(entry.attempts, 0);
        assert!(!entry.in_flight);
        assert_eq!(get_now(&queue).await, Some(k));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_does_not_block_eligible_ones() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60));
        let queue = WorkQueue::new(policy);
        queue.add(key("failing"));
        let failing = queue.get().await.unwrap();
        queue.done(&failing, false);

        queue.add(key("healthy"));
        assert_eq!(get_now(&queue).await, Some(key("healthy")));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_get_wakes_on_add() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(key("east-1"));
        assert_eq!(waiter.await.unwrap(), Some(key("east-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_schedules_a_recheck() {
        let queue = WorkQueue::default();
        queue.add(key("east-1"));
        let k = queue.get().await.unwrap();
        let start = Instant::now();
        queue.requeue_after(&k, Duration::from_secs(300));

        assert_eq!(get_now(&queue).await, None);
        assert_eq!(queue.get().await, Some(k));
        assert_elapsed(start, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_returns_key_without_counting_attempt() {
        let queue = Arc::new(WorkQueue::default());
        queue.add(key("east-1"));

        let lease = queue.lease().await.unwrap();
        assert_eq!(lease.key(), &key("east-1"));
        drop(lease);

        let entry = queue.entry(&key("east-1")).unwrap();
        assert!(!entry.in_flight);
        assert_eq!(entry.attempts, 0);
        assert_eq!(get_now(&queue).await, Some(key("east-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_lease_does_not_release_on_drop() {
        let queue = Arc::new(WorkQueue::default());
        queue.add(key("east-1"));
        queue.lease().await.unwrap().done(true);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_wakes_waiters_and_ignores_adds() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("east-1"));
        assert!(queue.is_empty());
        assert!(queue.is_shut_down());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_key_can_complete_after_shut_down() {
        let queue = WorkQueue::default();
        queue.add(key("east-1"));
        let k = queue.get().await.unwrap();
        queue.shut_down();
        queue.done(&k, true);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn done_for_unknown_key_is_ignored() {
        let queue = WorkQueue::default();
        queue.done(&key("ghost"), false);
        assert!(queue.is_empty());
    }
}
