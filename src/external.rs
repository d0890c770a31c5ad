//! Collaborator interfaces (§6).
//!
//! The coordination engine is deliberately ignorant of *how* values are
//! stored, *how* mutual exclusion across a farm is implemented, and *how*
//! messages fan out to every node — it depends only on these three traits.
//! A host application supplies concrete bindings (Redis, etcd, NATS, ...);
//! [`crate::backends::memory`] supplies an in-process reference backend
//! for tests and examples.

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// The external key/value store fronted by the memory-fronted external
/// cache (C2).
#[async_trait]
pub trait ExternalCache: Send + Sync {
    /// Upsert `value` under `key` with an absolute TTL.
    async fn string_set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Fetch `value` and its remaining TTL. Both-or-neither-absent: never
    /// returns a value without a TTL or a TTL without a value.
    async fn string_get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>>;

    /// Fetch the first `length` bytes of the stored string (or the whole
    /// string if shorter), without transferring the rest. Returns `None`
    /// if the key is absent.
    async fn get_string_start(&self, key: &str, length: usize) -> Result<Option<String>>;
}

/// A held distributed lock. Released when dropped.
pub trait DistributedLockGuard: Send + Sync {}

/// Factory for distributed mutual-exclusion locks.
#[async_trait]
pub trait DistributedLockFactory: Send + Sync {
    /// Attempt to acquire `lock_key`, auto-expiring after `expiry`
    /// regardless of this process's liveness. Returns `None` if another
    /// holder already has it.
    async fn create_lock(
        &self,
        lock_key: &str,
        expiry: Duration,
    ) -> Result<Option<Box<dyn DistributedLockGuard>>>;
}

/// A handler invoked for every message published on a subscribed topic.
/// Boxed and type-erased because the bus does not know the payload type;
/// callers deserialize inside the handler.
pub type BusHandler =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Non-durable fan-out publish/subscribe transport.
#[async_trait]
pub trait FanOutBus: Send + Sync {
    /// Subscribe `handler` to `topic`. Must not return until the
    /// subscription is live — a `publish` issued immediately afterward by
    /// any node must be observed by this subscriber.
    async fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<()>;

    /// Publish `payload` to every current subscriber of `topic`,
    /// at-least-once. Delivery may be synchronous or asynchronous.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

/// An optional, best-effort diagnostic sink. Implementations must be fast
/// and non-blocking; the coordination engine never waits on a trace write.
pub trait TraceWriter: Send + Sync {
    fn write(&self, message: &str);
}

impl fmt::Debug for dyn TraceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn TraceWriter>")
    }
}
