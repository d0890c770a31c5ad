//! Named-lock table (C1).
//!
//! A process-wide mapping from string name to mutex, with a non-blocking
//! `try_enter` and a blocking `enter`. Entries are refcounted: the last
//! guard to drop removes the map entry, bounding memory to the set of
//! names currently contended rather than every name ever touched.

use scc::HashMap as SccHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Duration;

struct Slot {
    mutex: Arc<Mutex<()>>,
    refcount: AtomicUsize,
}

/// A process-wide table of named mutexes.
pub struct NamedLockTable {
    slots: SccHashMap<String, Arc<Slot>>,
}

impl NamedLockTable {
    pub fn new() -> Self {
        Self {
            slots: SccHashMap::new(),
        }
    }

    fn slot_for(&self, name: &str) -> Arc<Slot> {
        loop {
            if let Some(slot) = self.slots.read(name, |_, slot| Arc::clone(slot)) {
                return slot;
            }
            let fresh = Arc::new(Slot {
                mutex: Arc::new(Mutex::new(())),
                refcount: AtomicUsize::new(0),
            });
            match self.slots.insert(name.to_string(), Arc::clone(&fresh)) {
                Ok(()) => return fresh,
                Err(_) => continue, // lost the race; re-read the winner's slot
            }
        }
    }

    fn release(&self, name: &str) {
        let mut should_remove = false;
        self.slots.read(name, |_, slot| {
            should_remove = slot.refcount.load(Ordering::Acquire) == 0;
        });
        if should_remove {
            // Re-check under removal: another caller may have re-entered
            // this name between the read above and now, bumping refcount
            // back up. `remove_if` only deletes while the predicate still
            // holds, so a race here is safe, not just best-effort.
            let _ = self
                .slots
                .remove_if(name, |slot| slot.refcount.load(Ordering::Acquire) == 0);
        }
    }

    /// Attempt to acquire the named lock, waiting up to `timeout`.
    /// `Duration::ZERO` means "return immediately if contended" — the
    /// single-flight discard path used throughout this crate.
    pub async fn try_enter(&self, name: &str, timeout: Duration) -> NamedLockGuard<'_> {
        let slot = self.slot_for(name);
        slot.refcount.fetch_add(1, Ordering::AcqRel);

        let guard = if timeout.is_zero() {
            slot.mutex.clone().try_lock_owned().ok()
        } else {
            tokio::time::timeout(timeout, slot.mutex.clone().lock_owned())
                .await
                .ok()
        };

        if guard.is_none() {
            slot.refcount.fetch_sub(1, Ordering::AcqRel);
        }

        NamedLockGuard {
            table: self,
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Acquire the named lock, waiting indefinitely. Used by the memory-
    /// fronted external cache's miss path (§4.2), which must serialize
    /// concurrent misses on the same key rather than discard them.
    pub async fn enter(&self, name: &str) -> NamedLockGuard<'_> {
        let slot = self.slot_for(name);
        slot.refcount.fetch_add(1, Ordering::AcqRel);
        let guard = slot.mutex.clone().lock_owned().await;
        NamedLockGuard {
            table: self,
            name: name.to_string(),
            _guard: Some(guard),
        }
    }
}

impl Default for NamedLockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped handle returned by [`NamedLockTable::try_enter`] /
/// [`NamedLockTable::enter`]. Dropping it releases the underlying mutex
/// and, once no other holder remains, removes the table entry.
pub struct NamedLockGuard<'a> {
    table: &'a NamedLockTable,
    name: String,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl NamedLockGuard<'_> {
    /// Whether this guard actually holds the lock. `false` means
    /// `try_enter` hit contention within its timeout — the caller should
    /// treat this as "someone else already has it" and do nothing.
    pub fn is_locked(&self) -> bool {
        self._guard.is_some()
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // A guard that never actually acquired the mutex (failed
        // `try_enter`) already had its refcount contribution undone
        // inline — decrementing again here would double-count and could
        // drop the slot out from under the caller that does hold it.
        if self._guard.take().is_some() {
            self.table
                .slot_for(&self.name)
                .refcount
                .fetch_sub(1, Ordering::AcqRel);
            self.table.release(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_enter_non_blocking_discard() {
        let table = NamedLockTable::new();
        let first = table.try_enter("k", Duration::ZERO).await;
        assert!(first.is_locked());

        let second = table.try_enter("k", Duration::ZERO).await;
        assert!(!second.is_locked());
    }

    #[tokio::test]
    async fn lock_is_released_and_reusable() {
        let table = NamedLockTable::new();
        {
            let guard = table.try_enter("k", Duration::ZERO).await;
            assert!(guard.is_locked());
        }
        let guard = table.try_enter("k", Duration::ZERO).await;
        assert!(guard.is_locked());
    }

    #[tokio::test]
    async fn independent_names_do_not_contend() {
        let table = NamedLockTable::new();
        let a = table.try_enter("a", Duration::ZERO).await;
        let b = table.try_enter("b", Duration::ZERO).await;
        assert!(a.is_locked());
        assert!(b.is_locked());
    }

    #[tokio::test]
    async fn entry_enter_waits_for_release() {
        let table = Arc::new(NamedLockTable::new());
        let first = table.try_enter("k", Duration::ZERO).await;
        assert!(first.is_locked());

        let table2 = Arc::clone(&table);
        let waiter = tokio::spawn(async move {
            let _guard = table2.enter("k").await;
        });

        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();
    }
}
