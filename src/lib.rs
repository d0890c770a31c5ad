//! A regenerative distributed cache coordinator: a library fronting a
//! slow-to-produce value with a two-tier cache (local TTL memory over an
//! external store), single-flight regeneration both process-local and
//! farm-wide, proactive background regeneration via a scheduled trigger,
//! and a pub/sub bus that lets peer nodes invalidate their local copies
//! and release their own waiters as soon as any one node refreshes a key.
//!
//! The engine is deliberately ignorant of *how* values are stored, *how*
//! mutual exclusion across a farm is implemented, and *how* messages fan
//! out to every node: [`external::ExternalCache`],
//! [`external::DistributedLockFactory`] and [`external::FanOutBus`] are
//! the only three collaborators it depends on. [`backends::memory`]
//! supplies an in-process reference implementation of all three for
//! tests, examples, and single-process use.

pub mod await_manager;
pub mod backends;
pub mod codec;
mod duration_cell;
pub mod error;
pub mod external;
pub mod manager;
pub mod mfec;
pub mod named_lock;
pub mod notification;
pub mod scheduler;

pub use await_manager::{AwaiterGuard, CorrelatedAwaitManager};
pub use error::{CodecError, Error, Result};
pub use external::{BusHandler, DistributedLockFactory, DistributedLockGuard, ExternalCache, FanOutBus, TraceWriter};
pub use manager::{GenerateFn, RegenerativeCacheManager, RegenerativeCacheManagerConfig};
pub use mfec::MemoryFrontedExternalCache;
pub use named_lock::{NamedLockGuard, NamedLockTable};
pub use notification::Notification;
pub use scheduler::{ScheduledTriggerManager, SchedulerConfig, TriggerCallback};
