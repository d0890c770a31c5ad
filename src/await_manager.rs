//! Correlated-await manager (C4).
//!
//! Lets many callers register interest in a key and later be released, all
//! at once, by a single `notify(msg)` that carries that key. Registration
//! and notification for a given key are serialized by the named-lock table
//! (C1) so that an awaiter created strictly before a `notify` can never be
//! missed; the swap-then-complete split keeps the per-key lock's critical
//! section short — completing a caller's continuation never happens while
//! the lock is held.

use crate::named_lock::NamedLockTable;
use crate::notification::Notification;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

type PendingAwaiters = Vec<(u64, oneshot::Sender<Notification>)>;

/// Manages one `A(key)` set per key (§3).
pub struct CorrelatedAwaitManager {
    awaiters: scc::HashMap<String, PendingAwaiters>,
    locks: NamedLockTable,
    next_id: AtomicU64,
}

impl CorrelatedAwaitManager {
    pub fn new() -> Self {
        Self {
            awaiters: scc::HashMap::new(),
            locks: NamedLockTable::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock_name(key: &str) -> String {
        format!("CorrelatedAwaitManager:{key}")
    }

    /// Register interest in `key`. The returned guard must be `.wait()`ed
    /// or `.cancel()`ed by the caller; if dropped without either, it
    /// removes itself from the pending set on a best-effort background
    /// task rather than leaking.
    pub async fn create_awaiter(self: &Arc<Self>, key: &str) -> AwaiterGuard {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let _guard = self.locks.enter(&Self::lock_name(key)).await;
        let exists = self.awaiters.read(key, |_, _| ()).is_some();
        if exists {
            let _ = self.awaiters.update(key, move |_, pending| pending.push((id, tx)));
        } else {
            let _ = self.awaiters.insert(key.to_string(), vec![(id, tx)]);
        }
        drop(_guard);

        AwaiterGuard {
            manager: Arc::clone(self),
            key: key.to_string(),
            id,
            rx: Some(rx),
            awaiting: false,
            released: false,
        }
    }

    /// Atomically swap out the entire pending set for `msg.key` under its
    /// per-key lock, then complete every member's channel outside the
    /// lock. Idempotent with respect to awaiter completion: each
    /// awaiter's channel can be completed at most once regardless of how
    /// many times `notify` races with itself for the same key (duplicate
    /// deliveries from an at-least-once bus are harmless).
    pub async fn notify(&self, msg: Notification) {
        let pending = {
            let _guard = self.locks.enter(&Self::lock_name(&msg.key)).await;
            self.awaiters
                .remove(&msg.key)
                .map(|(_, pending)| pending)
                .unwrap_or_default()
        };

        for (_, tx) in pending {
            let _ = tx.send(msg.clone());
        }
    }

    async fn discard(&self, key: &str, id: u64) {
        let _guard = self.locks.enter(&Self::lock_name(key)).await;
        let mut now_empty = false;
        let _ = self.awaiters.update(key, |_, pending| {
            pending.retain(|(existing_id, _)| *existing_id != id);
            now_empty = pending.is_empty();
        });
        if now_empty {
            let _ = self.awaiters.remove_if(key, |pending| pending.is_empty());
        }
    }
}

impl Default for CorrelatedAwaitManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl CorrelatedAwaitManager {
    /// Test-only window into the pending set's size, used to confirm a
    /// cancelled/dropped awaiter's entry actually leaves the map rather
    /// than lingering until some unrelated future `notify`.
    fn pending_count(&self, key: &str) -> usize {
        self.awaiters.read(key, |_, pending| pending.len()).unwrap_or(0)
    }
}

/// A scoped handle for one pending rendezvous. Exactly one of `.wait()` /
/// `.cancel()` should be called; both consume the guard.
pub struct AwaiterGuard {
    manager: Arc<CorrelatedAwaitManager>,
    key: String,
    id: u64,
    rx: Option<oneshot::Receiver<Notification>>,
    /// Set just before the receiver is handed to `.await` and cleared
    /// once it resolves. A guard whose driving future is dropped while
    /// suspended there (e.g. wrapped in `tokio::time::timeout`, or racing
    /// a peer node's regeneration) is caught by this flag even though
    /// `rx` itself was already taken — otherwise `Drop` would see
    /// `rx == None` and wrongly conclude no cleanup is needed, leaking
    /// the pending-set entry until some later, possibly nonexistent,
    /// `notify` for the same key.
    awaiting: bool,
    released: bool,
}

impl AwaiterGuard {
    /// Wait for the `notify` that completes this awaiter. Returns `None`
    /// if the manager was dropped (or the sender half lost) without ever
    /// notifying this key, which should not happen in normal operation.
    pub async fn wait(mut self) -> Option<Notification> {
        let Some(rx) = self.rx.take() else {
            return None;
        };
        self.awaiting = true;
        let result = rx.await;
        self.awaiting = false;
        self.released = true;
        result.ok()
    }

    /// Cancel this awaiter: remove it from the pending set without
    /// waiting. Idempotent — calling it twice, or after `wait`, is a
    /// no-op.
    pub async fn cancel(mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.rx.take().is_some() {
            self.manager.discard(&self.key, self.id).await;
        }
    }
}

impl Drop for AwaiterGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Either the guard never called `wait`/`cancel` (`rx` still
        // present), or it did and was cancelled mid-`.await` (`rx` was
        // already taken but `awaiting` is still true because the
        // receiver never resolved). Both need the same discard.
        let needs_discard = self.rx.take().is_some() || self.awaiting;
        if needs_discard {
            let manager = Arc::clone(&self.manager);
            let key = self.key.clone();
            let id = self.id;
            tokio::spawn(async move {
                manager.discard(&key, id).await;
            });
        }
    }
}
