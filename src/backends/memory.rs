//! In-process reference backend.
//!
//! [`InProcessBackend`] implements all three collaborator traits over
//! shared `Arc` state. Constructing several [`crate::manager::RegenerativeCacheManager`]s
//! around one `Arc<InProcessBackend>` emulates an N-node farm within a
//! single process — the shared store stands in for the external cache,
//! the shared lock table for the distributed lock service, and the shared
//! subscriber list for the farm-wide bus.
//!
//! This is a reference/test backend, not a production one: lock
//! acquisition under contention is check-then-act rather than atomic
//! compare-and-swap, which is fine for one process's worth of concurrent
//! tasks but would not hold up across a real network.

use crate::error::Result;
use crate::external::{BusHandler, DistributedLockFactory, DistributedLockGuard, ExternalCache, FanOutBus, TraceWriter};
use async_trait::async_trait;
use scc::HashMap as SccHashMap;
use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

struct LockSlot {
    holder: Uuid,
    expires_at: Instant,
}

/// Shared external-cache, distributed-lock, and fan-out-bus emulation.
pub struct InProcessBackend {
    store: SccHashMap<String, StoredValue>,
    locks: Arc<SccHashMap<String, LockSlot>>,
    bus: Mutex<StdHashMap<String, Vec<BusHandler>>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self {
            store: SccHashMap::new(),
            locks: Arc::new(SccHashMap::new()),
            bus: Mutex::new(StdHashMap::new()),
        }
    }
}

impl Default for InProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalCache for InProcessBackend {
    async fn string_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = StoredValue {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        if self.store.insert(key.to_string(), entry.clone()).is_err() {
            let _ = self.store.update(key, |_, existing| *existing = entry);
        }
        Ok(())
    }

    async fn string_get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>> {
        let mut hit = None;
        let mut expired = false;
        self.store.read(key, |_, entry| {
            let remaining = entry.expires_at.saturating_duration_since(Instant::now());
            if remaining > Duration::ZERO {
                hit = Some((entry.value.clone(), remaining));
            } else {
                expired = true;
            }
        });
        if expired {
            let _ = self.store.remove(key);
        }
        Ok(hit)
    }

    async fn get_string_start(&self, key: &str, length: usize) -> Result<Option<String>> {
        let full = self.string_get_with_expiry(key).await?;
        Ok(full.map(|(value, _)| value.chars().take(length).collect()))
    }
}

struct InProcessLockGuard {
    locks: Arc<SccHashMap<String, LockSlot>>,
    key: String,
    holder: Uuid,
}

impl DistributedLockGuard for InProcessLockGuard {}

impl Drop for InProcessLockGuard {
    fn drop(&mut self) {
        let _ = self
            .locks
            .remove_if(&self.key, |slot| slot.holder == self.holder);
    }
}

#[async_trait]
impl DistributedLockFactory for InProcessBackend {
    async fn create_lock(
        &self,
        lock_key: &str,
        expiry: Duration,
    ) -> Result<Option<Box<dyn DistributedLockGuard>>> {
        let holder = Uuid::new_v4();
        let now = Instant::now();
        let expires_at = now + expiry;

        let acquired = match self.locks.insert(
            lock_key.to_string(),
            LockSlot {
                holder,
                expires_at,
            },
        ) {
            Ok(()) => true,
            Err(_) => {
                let mut claimed = false;
                let _ = self.locks.update(lock_key, |_, existing| {
                    if existing.expires_at <= now {
                        existing.holder = holder;
                        existing.expires_at = expires_at;
                        claimed = true;
                    }
                });
                claimed
            }
        };

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(InProcessLockGuard {
            locks: Arc::clone(&self.locks),
            key: lock_key.to_string(),
            holder,
        })))
    }
}

#[async_trait]
impl FanOutBus for InProcessBackend {
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()> {
        let mut subs = self.bus.lock().unwrap();
        subs.entry(topic.to_string()).or_default().push(handler);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let handlers = {
            let subs = self.bus.lock().unwrap();
            subs.get(topic).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(payload.to_string()).await;
        }
        Ok(())
    }
}

/// Forwards trace writes to `tracing::debug!`, for examples and tests
/// that want to see them without wiring up a custom sink.
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn write(&self, message: &str) {
        tracing::debug!(target: "regen_cache", "{message}");
    }
}
