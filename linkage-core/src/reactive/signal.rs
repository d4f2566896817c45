//! Staleness Signals
//!
//! Every reactive array owns one [`Signal`]. The signal carries no data:
//! the array's membership lives in the graph or the store, and the signal
//! only records whether the array's cached copy can still be trusted.
//!
//! A signal is created stale. Reading the array re-synchronizes it and
//! clears the flag; a change to the underlying relationship raises the flag
//! again and tells the subscribers. Raising an already stale signal through
//! [`Signal::raise`] is silent, so a change reported once by the store is
//! not reported a second time by the array that caused it.
//!
//! Callbacks are copied out of the subscriber table before they run, so a
//! callback may subscribe again or read the array.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by a subscription, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new() -> Self {
        Self(NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Stale flag plus the callbacks interested in it.
pub struct Signal {
    stale: AtomicBool,
    callbacks: RwLock<IndexMap<SubscriberId, Callback>>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            stale: AtomicBool::new(true),
            callbacks: RwLock::new(IndexMap::new()),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Flag the cached copy as outdated without telling anyone.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn mark_clean(&self) {
        self.stale.store(false, Ordering::Release);
    }

    /// Flag the cached copy as outdated and run every callback.
    pub fn notify(&self) {
        self.mark_stale();
        self.run_callbacks();
    }

    /// Like [`notify`](Self::notify), but only when the signal was clean.
    /// Returns whether callbacks ran.
    pub fn raise(&self) -> bool {
        if self.stale.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.run_callbacks();
        true
    }

    fn run_callbacks(&self) {
        let callbacks: Vec<Callback> = self.callbacks.read().values().cloned().collect();
        for callback in callbacks {
            callback();
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        self.callbacks.write().insert(id, Arc::new(callback));
        id
    }

    /// Cancel a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.callbacks.write().shift_remove(&id).is_some()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.callbacks.read().is_empty()
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("stale", &self.is_stale())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

// ---- Tests ----
