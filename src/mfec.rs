//! Memory-fronted external cache (C2).
//!
//! Layers a local, process-memory TTL cache over an [`ExternalCache`]
//! collaborator: hits are served without crossing the external store;
//! misses are serialized per key (via the named-lock table) so that N
//! concurrent misses on the same key cost at most one external round-trip.

use crate::external::ExternalCache;
use crate::named_lock::NamedLockTable;
use crate::Result;
use scc::HashMap as SccHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const KEY_PREFIX: &str = "MemoryFrontedExternalCache";

#[derive(Clone)]
struct LocalEntry {
    value: String,
    expires_at: Instant,
}

impl LocalEntry {
    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// A local-memory-fronted view of an external key/value store, scoped to
/// one keyspace.
pub struct MemoryFrontedExternalCache {
    keyspace: String,
    local: SccHashMap<String, LocalEntry>,
    external: Arc<dyn ExternalCache>,
    miss_locks: NamedLockTable,
}

impl MemoryFrontedExternalCache {
    pub fn new(keyspace: impl Into<String>, external: Arc<dyn ExternalCache>) -> Self {
        Self {
            keyspace: keyspace.into(),
            local: SccHashMap::new(),
            external,
            miss_locks: NamedLockTable::new(),
        }
    }

    /// The external-store key for `key`, bit-exact per the wire naming
    /// contract: `MemoryFrontedExternalCache:{keyspace}:Item:{key}`.
    pub fn external_key(&self, key: &str) -> String {
        format!("{KEY_PREFIX}:{}:Item:{key}", self.keyspace)
    }

    /// Write `value` into the local cache and the external store, both
    /// with an absolute TTL of `ttl` from now.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.upsert_local(key, value.to_string(), ttl);
        self.external
            .string_set(&self.external_key(key), value, ttl)
            .await?;
        Ok(())
    }

    fn upsert_local(&self, key: &str, value: String, ttl: Duration) {
        let entry = LocalEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if self.local.insert(key.to_string(), entry.clone()).is_err() {
            let _ = self.local.update(key, |_, existing| *existing = entry);
        }
    }

    /// Read `key`, consulting the external store on a local miss. Never
    /// returns a value whose remaining lifetime is zero or negative.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.local_hit(key) {
            return Ok(Some(value));
        }

        let lock_name = format!("{KEY_PREFIX}:miss:{}:{key}", self.keyspace);
        let _guard = self.miss_locks.enter(&lock_name).await;

        // Double-check: another waiter may have already populated the
        // local cache while we queued for the lock.
        if let Some(value) = self.local_hit(key) {
            return Ok(Some(value));
        }

        let started = Instant::now();
        let fetched = self
            .external
            .string_get_with_expiry(&self.external_key(key))
            .await?;

        let Some((value, remote_ttl)) = fetched else {
            return Ok(None);
        };

        let elapsed = Instant::now().saturating_duration_since(started);
        let adjusted_ttl = remote_ttl.saturating_sub(elapsed);
        if adjusted_ttl.is_zero() {
            return Ok(None);
        }

        self.upsert_local(key, value.clone(), adjusted_ttl);
        Ok(Some(value))
    }

    /// Best-effort read of the first `n` characters of the stored value.
    /// Never writes through to the local cache — a partial read must
    /// never be mistaken for a cached full value.
    pub async fn get_prefix(&self, key: &str, n: usize) -> Result<Option<String>> {
        let mut local_slice = None;
        self.local.read(key, |_, entry| {
            if entry.remaining() > Duration::ZERO {
                local_slice = Some(entry.value.chars().take(n).collect::<String>());
            }
        });
        if local_slice.is_some() {
            return Ok(local_slice);
        }

        self.external.get_string_start(&self.external_key(key), n).await
    }

    /// Drop only the in-process copy of `key`, forcing the next `get` to
    /// read through to the external store.
    pub fn remove_local(&self, key: &str) {
        let _ = self.local.remove(key);
    }

    fn local_hit(&self, key: &str) -> Option<String> {
        let mut hit = None;
        let mut expired = false;
        self.local.read(key, |_, entry| {
            if entry.remaining() > Duration::ZERO {
                hit = Some(entry.value.clone());
            } else {
                expired = true;
            }
        });
        if expired {
            let _ = self.local.remove(key);
        }
        hit
    }
}
