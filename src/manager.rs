//! Regenerative cache manager (C6) — the top-level coordinator.
//!
//! Wires the named-lock table (C1), memory-fronted external cache (C2),
//! timestamped codec (C3), correlated-await manager (C4), and scheduled-
//! trigger manager (C5) together behind one public operation,
//! [`RegenerativeCacheManager::get_or_add`].

use crate::await_manager::CorrelatedAwaitManager;
use crate::codec;
use crate::duration_cell::DurationCell;
use crate::error::{Error, Result};
use crate::external::{DistributedLockFactory, ExternalCache, FanOutBus, TraceWriter};
use crate::mfec::MemoryFrontedExternalCache;
use crate::named_lock::NamedLockTable;
use crate::notification::Notification;
use crate::scheduler::{ScheduledTriggerManager, SchedulerConfig, TriggerCallback};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const RCM_PREFIX: &str = "RegenerativeCacheManager";

/// A value-producing callback. Modeled as a boxed async closure rather
/// than a generic so one [`RegenerativeCacheManager`] can hold callbacks
/// for many distinct keys (and hand the same one to the scheduler) without
/// monomorphizing per call site.
pub type GenerateFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

/// Construction-time configuration. `cache_expiry_tolerance`,
/// `farm_clock_tolerance`, `minimum_forward_scheduling` and
/// `trigger_delay` are mutable after construction; `keyspace` and `host`
/// are not, since they are baked into derived names at construction time.
#[derive(Clone)]
pub struct RegenerativeCacheManagerConfig {
    pub keyspace: String,
    pub host: String,
    pub cache_expiry_tolerance: Duration,
    pub farm_clock_tolerance: Duration,
    pub minimum_forward_scheduling: Duration,
    pub trigger_delay: Duration,
}

impl RegenerativeCacheManagerConfig {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            host: "local".to_string(),
            cache_expiry_tolerance: Duration::from_secs(30),
            farm_clock_tolerance: Duration::from_secs(15),
            minimum_forward_scheduling: Duration::from_secs(5),
            trigger_delay: Duration::from_secs(1),
        }
    }
}

/// The coordination engine fronting a slow value source with a two-tier
/// cache, proactive background regeneration, and farm-wide single-flight
/// via a distributed lock.
pub struct RegenerativeCacheManager {
    keyspace: String,
    cache_expiry_tolerance: DurationCell,
    farm_clock_tolerance: DurationCell,
    /// Mirrors `stm`'s own trigger-delay cell: the same knob is read both
    /// here (for the freshness-slack calculation in
    /// `regeneration_due_at`) and inside the scheduler (for heap-wakeup
    /// padding), so `set_trigger_delay` updates both in lockstep.
    trigger_delay: DurationCell,
    topic: String,
    lock_prefix: String,
    local_lock_prefix: String,
    local_sender_id: String,
    mfec: MemoryFrontedExternalCache,
    cam: Arc<CorrelatedAwaitManager>,
    stm: Arc<ScheduledTriggerManager>,
    local_locks: NamedLockTable,
    lock_factory: Arc<dyn DistributedLockFactory>,
    bus: Arc<dyn FanOutBus>,
    trace_writer: Option<Arc<dyn TraceWriter>>,
}

impl RegenerativeCacheManager {
    /// Construct a manager and subscribe it to its farm-wide notification
    /// topic. The subscription must be live before this returns — callers
    /// racing a peer's first regeneration must not miss it.
    pub async fn new(
        config: RegenerativeCacheManagerConfig,
        external: Arc<dyn ExternalCache>,
        lock_factory: Arc<dyn DistributedLockFactory>,
        bus: Arc<dyn FanOutBus>,
        trace_writer: Option<Arc<dyn TraceWriter>>,
    ) -> Result<Arc<Self>> {
        let instance_guid = Uuid::new_v4();
        let topic = format!("{RCM_PREFIX}:ResultNotification:{}", config.keyspace);
        let lock_prefix = format!("{RCM_PREFIX}:RegenerateIfNotUnderway:{}:", config.keyspace);
        let local_lock_prefix =
            format!("{RCM_PREFIX}:RegenerateIfNotUnderway:{}:{instance_guid}:", config.keyspace);
        let local_sender_id = format!("{}-{}-{instance_guid}", config.host, config.keyspace);

        let manager = Arc::new(Self {
            keyspace: config.keyspace.clone(),
            cache_expiry_tolerance: DurationCell::new(config.cache_expiry_tolerance),
            farm_clock_tolerance: DurationCell::new(config.farm_clock_tolerance),
            trigger_delay: DurationCell::new(config.trigger_delay),
            topic: topic.clone(),
            lock_prefix,
            local_lock_prefix,
            local_sender_id,
            mfec: MemoryFrontedExternalCache::new(config.keyspace.clone(), external),
            cam: Arc::new(CorrelatedAwaitManager::new()),
            stm: ScheduledTriggerManager::spawn(SchedulerConfig {
                minimum_forward_scheduling: config.minimum_forward_scheduling,
                trigger_delay: config.trigger_delay,
            }),
            local_locks: NamedLockTable::new(),
            lock_factory,
            bus,
            trace_writer,
        });

        let subscriber = Arc::clone(&manager);
        manager
            .bus
            .subscribe(
                &topic,
                Arc::new(move |payload: String| {
                    let subscriber = Arc::clone(&subscriber);
                    Box::pin(async move { subscriber.handle_notification(payload).await })
                }),
            )
            .await?;

        Ok(manager)
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Current slack added to `E(key)`'s external-store TTL beyond
    /// `interval` (§4.6).
    pub fn cache_expiry_tolerance(&self) -> Duration {
        self.cache_expiry_tolerance.get()
    }

    /// spec.md §4.6 lists this as mutable post-construction: adjusts the
    /// TTL slack applied to every `mfec.set` from now on.
    pub fn set_cache_expiry_tolerance(&self, value: Duration) {
        self.cache_expiry_tolerance.set(value);
    }

    /// Current assumed bound on inter-node clock drift (§4.6).
    pub fn farm_clock_tolerance(&self) -> Duration {
        self.farm_clock_tolerance.get()
    }

    /// spec.md §4.6 lists this as mutable post-construction: adjusts the
    /// freshness slack used by `is_not_yet_due` from now on.
    pub fn set_farm_clock_tolerance(&self, value: Duration) {
        self.farm_clock_tolerance.set(value);
    }

    /// Current slack added to heap wakeups and subtracted from the
    /// freshness window (§4.5, §4.6).
    pub fn trigger_delay(&self) -> Duration {
        self.trigger_delay.get()
    }

    /// spec.md §4.6 lists this as mutable post-construction. Updates both
    /// this manager's own copy (used by `regeneration_due_at`) and the
    /// scheduler's (used for heap-wakeup padding) so the single knob stays
    /// consistent everywhere it is read.
    pub fn set_trigger_delay(&self, value: Duration) {
        self.trigger_delay.set(value);
        self.stm.set_trigger_delay(value);
    }

    /// Current floor on how soon a newly (re)armed trigger may fire (§4.5).
    pub fn minimum_forward_scheduling(&self) -> Duration {
        self.stm.minimum_forward_scheduling()
    }

    /// spec.md §4.6 lists this as mutable post-construction; forwarded
    /// directly to the scheduler, the only component that reads it.
    pub fn set_minimum_forward_scheduling(&self, value: Duration) {
        self.stm.set_minimum_forward_scheduling(value);
    }

    /// §4.6.1. Return the current value for `key`, generating it (and
    /// blocking on that generation) if no unexpired entry exists, and
    /// arming background regeneration when `inactive_retention > interval`.
    pub async fn get_or_add(
        self: &Arc<Self>,
        key: &str,
        generate: GenerateFn,
        inactive_retention: Duration,
        interval: Duration,
    ) -> Result<String> {
        let trigger_required = inactive_retention > interval;

        let trigger_existed = if trigger_required {
            self.stm.update_last_activity(key)
        } else {
            false
        };

        let cached = self.read_cached(key).await?;

        if let Some((_, value)) = &cached {
            if !trigger_required || trigger_existed {
                return Ok(value.clone());
            }
        }
        if let Some((created_at, value)) = &cached {
            if trigger_required && !trigger_existed {
                self.schedule_trigger(key, *created_at, inactive_retention, interval, Arc::clone(&generate));
                return Ok(value.clone());
            }
        }

        // Miss path: register interest before kicking off regeneration so
        // a peer's notification arriving mid-generation can never be
        // missed, then drive the single-flight regeneration ourselves.
        let awaiter = self.cam.create_awaiter(key).await;
        self.regenerate_if_not_underway(key, Arc::clone(&generate), interval, false)
            .await;

        let notification = awaiter.wait().await.ok_or_else(|| {
            Error::GenerationFailed(format!(
                "awaiter for key {key:?} was dropped without a notification"
            ))
        })?;

        if !notification.success {
            return Err(Error::GenerationFailed(
                notification
                    .error
                    .unwrap_or_else(|| "generation failed with no error detail".to_string()),
            ));
        }

        let Some((created_at, value)) = self.read_cached(key).await? else {
            return Err(Error::GenerationRaced(key.to_string()));
        };

        if trigger_required {
            self.schedule_trigger(key, created_at, inactive_retention, interval, generate);
        }

        Ok(value)
    }

    async fn read_cached(&self, key: &str) -> Result<Option<(DateTime<Utc>, String)>> {
        let Some(encoded) = self.mfec.get(key).await? else {
            return Ok(None);
        };
        let (created_at, value) = codec::decode(&encoded)?;
        Ok(Some((created_at, value)))
    }

    fn schedule_trigger(
        self: &Arc<Self>,
        key: &str,
        created_at: DateTime<Utc>,
        inactive_retention: Duration,
        interval: Duration,
        generate: GenerateFn,
    ) {
        let this = Arc::clone(self);
        let key_owned = key.to_string();
        let callback: TriggerCallback = Arc::new(move || {
            let this = Arc::clone(&this);
            let key = key_owned.clone();
            let generate = Arc::clone(&generate);
            Box::pin(async move {
                this.regenerate_if_not_underway(&key, generate, interval, true)
                    .await;
            })
        });
        // This manager does not yet originate a request-scoped trace id of
        // its own (no tracing span propagation wired up at this layer);
        // `ensure_scheduled`'s `trace_id` still exists for hosts driving
        // the scheduler directly, or a future `get_or_add` overload that
        // accepts one explicitly.
        self.stm
            .ensure_scheduled(key, created_at, inactive_retention, interval, callback, None);
    }

    /// §4.6.2. Single-flight regeneration: process-local via the named
    /// lock, farm-wide via the distributed lock. Both locks are released
    /// at the end of this function's scope, distributed first since it
    /// is declared after the local guard.
    pub async fn regenerate_if_not_underway(
        &self,
        key: &str,
        generate: GenerateFn,
        interval: Duration,
        is_background: bool,
    ) {
        if is_background && self.is_not_yet_due(key, interval).await {
            return;
        }

        let local_lock_name = format!("{}{key}", self.local_lock_prefix);
        let local_guard = self.local_locks.try_enter(&local_lock_name, Duration::ZERO).await;
        if !local_guard.is_locked() {
            return;
        }

        let lock_key = format!("{}{key}", self.lock_prefix);
        let distributed_guard = match self.lock_factory.create_lock(&lock_key, interval).await {
            Ok(Some(guard)) => guard,
            Ok(None) => return,
            Err(err) => {
                self.emit_trace(&format!("distributed lock error for {key}: {err}"));
                return;
            }
        };

        if self.is_not_yet_due(key, interval).await {
            // Another node already refreshed it while we queued for the
            // distributed lock; skip generation but still notify, since
            // awaiters may be blocked on this cycle.
            self.deliver(Notification::success(key, &self.local_sender_id)).await;
            drop(distributed_guard);
            drop(local_guard);
            return;
        }

        let generation_started = Utc::now();
        let started = Instant::now();
        let notification = match generate().await {
            Ok(value) => {
                let elapsed = started.elapsed();
                if elapsed > interval.saturating_sub(self.farm_clock_tolerance.get()) {
                    tracing::warn!(
                        key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "generation exceeded interval tolerance; the farm is likely overloaded"
                    );
                }
                let encoded = codec::encode(generation_started, &value);
                let ttl = interval + self.cache_expiry_tolerance.get();
                match self.mfec.set(key, &encoded, ttl).await {
                    Ok(()) => Notification::success(key, &self.local_sender_id),
                    Err(err) => Notification::failure(key, &self.local_sender_id, err.to_string()),
                }
            }
            Err(err) => Notification::failure(key, &self.local_sender_id, err.to_string()),
        };

        self.deliver(notification).await;
        drop(distributed_guard);
        drop(local_guard);
    }

    /// The background freshness short-circuit shared by step 1 and step 4
    /// of §4.6.2: is the externally stored entry for `key` still fresh
    /// enough, accounting for farm clock skew and scheduler jitter, that
    /// regeneration can be skipped?
    async fn is_not_yet_due(&self, key: &str, interval: Duration) -> bool {
        let Ok(Some(prefix)) = self.mfec.get_prefix(key, 50).await else {
            return false;
        };
        let Ok(created_at) = codec::decode_timestamp(&prefix) else {
            return false;
        };
        self.regeneration_due_at(created_at, interval) > Utc::now()
    }

    fn regeneration_due_at(&self, created_at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
        let slack = self.farm_clock_tolerance.get() + self.trigger_delay.get();
        created_at + to_chrono(interval) - to_chrono(slack)
    }

    async fn deliver(&self, notification: Notification) {
        self.cam.notify(notification.clone()).await;
        match notification.to_json() {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(&self.topic, &payload).await {
                    self.emit_trace(&format!(
                        "bus publish failed for key {:?}: {err}",
                        notification.key
                    ));
                }
            }
            Err(err) => self.emit_trace(&format!("failed to encode notification: {err}")),
        }
    }

    /// Construction subscribes this closure to the topic (§4.6). Ordering
    /// matters: invalidate the local copy before releasing awaiters, so a
    /// continuation that re-reads immediately after `notify` never sees a
    /// stale value.
    async fn handle_notification(&self, payload: String) {
        let notification = match Notification::from_json(&payload) {
            Ok(n) => n,
            Err(err) => {
                self.emit_trace(&format!("dropping malformed notification: {err}"));
                return;
            }
        };

        if notification.success && !notification.is_own_echo(&self.local_sender_id) {
            self.mfec.remove_local(&notification.key);
        }

        self.cam.notify(notification).await;
    }

    fn emit_trace(&self, message: &str) {
        tracing::debug!(target: "regen_cache", keyspace = %self.keyspace, "{message}");
        if let Some(writer) = &self.trace_writer {
            writer.write(message);
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}
