//! Inflight call registry: one leader record per fingerprint, carrying the
//! waiter list that the leader fans its result out to.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::Outcome;

const STATE_EXECUTING: u8 = 0;
const STATE_DONE: u8 = 1;

/// Mutable interior of an [`InflightCall`], guarded by the record mutex.
#[derive(Debug, Default)]
struct CallInner {
    /// One single-shot channel per follower (plus the leader's own). Each
    /// sender is consumed by exactly one send attempt.
    waiters: Vec<oneshot::Sender<Outcome>>,
    /// Empty while executing; populated exactly once on the transition to
    /// done and never mutated afterwards.
    result: Option<Outcome>,
}

/// One active execution.
///
/// The registry owns the record. The leader holds a shared handle only to
/// flip the state and harvest the waiter list; followers hold one only long
/// enough to enlist a waiter or observe that the call already finished.
#[derive(Debug)]
pub(crate) struct InflightCall {
    /// Monotonic: executing → done, never back.
    state: AtomicU8,
    inner: Mutex<CallInner>,
}

/// What a caller got out of [`InflightCall::join`].
pub(crate) enum Joined {
    /// The leader already finished but has not yet published to the cache;
    /// the result was copied out directly. Enlisting a waiter here would
    /// mean waiting on a leader that already left.
    Finished(Outcome),
    /// Enlisted; the leader will deliver on this channel.
    Waiting(oneshot::Receiver<Outcome>),
}

impl InflightCall {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_EXECUTING),
            inner: Mutex::new(CallInner::default()),
        }
    }

    /// Enlist as a waiter, or copy out the finished result.
    pub fn join(&self) -> Joined {
        let mut inner = self.inner.lock();
        if self.state.load(Ordering::Acquire) == STATE_DONE {
            let result = inner
                .result
                .clone()
                .unwrap_or_else(|| unreachable!("done implies a stored result"));
            return Joined::Finished(result);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);
        Joined::Waiting(rx)
    }

    /// Store the result, flip to done, and hand the waiter list back to the
    /// caller, who delivers outside all locks.
    pub fn finish(&self, outcome: Outcome) -> Vec<oneshot::Sender<Outcome>> {
        let mut inner = self.inner.lock();
        inner.result = Some(outcome);
        self.state.store(STATE_DONE, Ordering::Release);
        std::mem::take(&mut inner.waiters)
    }

    /// Harvest the waiter list without touching the result. Used by the
    /// shutdown drain; a leader finishing afterwards finds the list empty
    /// and delivers to no one, so every waiter is still signalled exactly
    /// once.
    pub fn take_waiters(&self) -> Vec<oneshot::Sender<Outcome>> {
        std::mem::take(&mut self.inner.lock().waiters)
    }
}

/// Keyed registry of inflight calls.
///
/// The engine wraps this in an `RwLock`; [`get_or_install`] relies on the
/// exclusive guard being held across its check-and-insert, which is what
/// makes leader election atomic.
///
/// [`get_or_install`]: InflightRegistry::get_or_install
#[derive(Debug)]
pub(crate) struct InflightRegistry<K> {
    calls: HashMap<K, Arc<InflightCall>>,
}

impl<K: Eq + Hash + Clone> InflightRegistry<K> {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
        }
    }

    /// Return the record for `key`, installing a fresh one if absent.
    /// `true` means the caller was elected leader.
    pub fn get_or_install(&mut self, key: &K) -> (Arc<InflightCall>, bool) {
        match self.calls.entry(key.clone()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
            Entry::Vacant(vacant) => {
                let record = Arc::new(InflightCall::new());
                vacant.insert(Arc::clone(&record));
                (record, true)
            }
        }
    }

    /// Remove the record for `key`. The remover owns the matching gauge
    /// decrement, which is how the drain and a finishing leader avoid
    /// double-counting each other.
    pub fn remove(&mut self, key: &K) -> Option<Arc<InflightCall>> {
        self.calls.remove(key)
    }

    /// Empty the registry, returning every residual record. Shutdown only.
    pub fn drain(&mut self) -> Vec<Arc<InflightCall>> {
        self.calls.drain().map(|(_, record)| record).collect()
    }
}
