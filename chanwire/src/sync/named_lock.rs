//! Named, reference-counted locks.
//!
//! A [`NamedLock`] hands out one re-entrant mutex per key. Entries exist only
//! while somebody holds or waits for the key: the first `acquire` creates the
//! entry with a reference count of one, every later `acquire` bumps the
//! count, and the entry is dropped from the map when the count returns to
//! zero. A failed acquisition gives its reference back immediately.
//!
//! ```text
//! acquire(k) ──► map lock: refs += 1 ──► bounded wait on entry ──┬─► held
//!                                                               └─► timed out: refs -= 1
//! release(k) ──► map lock: refs -= 1 (remove at 0) ──► unlock entry
//! ```
//!
//! Waiting always has a deadline, so a lost release shows up as a failed
//! acquire rather than a deadlock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::trace::{trace, warn};

#[derive(Default)]
struct Ownership {
    owner: Option<ThreadId>,
    holds: u32,
}

/// One re-entrant mutex with its waiters' condition variable.
#[derive(Default)]
struct Entry {
    refs: Mutex<usize>,
    state: Mutex<Ownership>,
    released: Condvar,
}

impl Entry {
    fn lock(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            state.holds += 1;
            return true;
        }

        if state.owner.is_some() {
            if timeout.is_zero() {
                return false;
            }
            let deadline = Instant::now() + timeout;
            while state.owner.is_some() {
                if self.released.wait_until(&mut state, deadline).timed_out() && state.owner.is_some() {
                    return false;
                }
            }
        }

        state.owner = Some(me);
        state.holds = 1;
        true
    }

    fn unlock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }
        state.holds -= 1;
        if state.holds == 0 {
            state.owner = None;
            self.released.notify_one();
        }
        true
    }
}

/// Registry of bounded-wait mutexes keyed by `K`.
pub struct NamedLock<K> {
    entries: Mutex<HashMap<K, Arc<Entry>>>,
}

impl<K> NamedLock<K>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires the lock for `key`, waiting at most `timeout`.
    ///
    /// A zero timeout tries once without waiting. Returns `false` if the lock
    /// is still held by another thread when the wait ends. The lock is
    /// re-entrant: the holding thread may acquire it again, and must release
    /// it once per successful acquire.
    pub fn acquire(&self, key: K, timeout: Duration) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            let entry = Arc::clone(entries.entry(key.clone()).or_default());
            *entry.refs.lock() += 1;
            entry
        };

        if entry.lock(timeout) {
            return true;
        }

        trace!(timeout_ms = timeout.as_millis() as u64, "named lock wait timed out");
        self.drop_reference(&key);
        false
    }

    /// Releases a lock previously acquired by the calling thread.
    ///
    /// Returns `false` (and changes nothing) if `key` is unknown or held by a
    /// different thread.
    pub fn release(&self, key: &K) -> bool {
        let Some(entry) = self.entries.lock().get(key).map(Arc::clone) else {
            warn!("release of a named lock that is not registered");
            return false;
        };

        if !entry.unlock() {
            warn!("release of a named lock held by another thread");
            return false;
        }

        self.drop_reference(key);
        true
    }

    /// Acquires `key` and returns a guard that releases it on drop.
    pub fn lock(&self, key: K, timeout: Duration) -> Option<NamedLockGuard<'_, K>> {
        if self.acquire(key.clone(), timeout) {
            Some(NamedLockGuard { locks: self, key })
        } else {
            None
        }
    }

    /// Number of keys with a live entry.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `key` currently has an entry (held or waited for).
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn drop_reference(&self, key: &K) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return;
        };
        let mut refs = entry.refs.lock();
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            drop(refs);
            entries.remove(key);
        }
    }
}

impl<K> Default for NamedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`NamedLock::lock`].
pub struct NamedLockGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a NamedLock<K>,
    key: K,
}

impl<K> NamedLockGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for NamedLockGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}
