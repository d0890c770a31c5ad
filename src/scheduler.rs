//! Scheduled-trigger manager (C5).
//!
//! Rearchitected around a priority queue and a single background task
//! instead of a host TTL-map-with-removal-callback (no such primitive
//! exists in this crate's dependency stack): a `BinaryHeap` orders nodes by
//! `target_callback_time`, and one task sleeps until the next one is due,
//! pops it, and runs the removed-callback logic in place. A node can be
//! rescheduled in place (bumping its `generation`) without touching the
//! heap; stale heap entries from a superseded generation are discarded
//! when popped rather than removed up front, the usual lazy-deletion
//! trick for a priority queue that does not support arbitrary removal.

use crate::duration_cell::DurationCell;
use chrono::{DateTime, Utc};
use scc::HashMap as SccHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// The callback invoked when a key's trigger fires. Type-erased because
/// the scheduler does not know what a regeneration does, only that it
/// runs to completion eventually.
pub type TriggerCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone, Copy)]
pub struct SchedulerConfig {
    /// Floor on how soon a newly computed trigger may fire, preventing
    /// unbounded recursion when generation keeps exceeding `interval`.
    pub minimum_forward_scheduling: Duration,
    /// Slack added to every heap wakeup to tolerate scheduler jitter.
    pub trigger_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            minimum_forward_scheduling: Duration::from_secs(5),
            trigger_delay: Duration::from_secs(1),
        }
    }
}

struct TriggerNode {
    generation: u64,
    /// The logical due instant, independent of the jitter padding applied
    /// to heap entries — rearm math chains off this, never off a padded
    /// value, so the pad does not compound cycle over cycle.
    target_callback_time: Instant,
    last_active: Instant,
    inactive_retention: Duration,
    interval: Duration,
    callback: TriggerCallback,
    /// Opaque correlation id carried through from `ensure_scheduled`,
    /// surfaced on the firing's tracing event so a regeneration can be
    /// traced back to the request that first armed its trigger.
    trace_id: Option<String>,
}

struct HeapEntry {
    /// Padded wake instant: `target_callback_time + trigger_delay`.
    wake_at: Instant,
    key: String,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.wake_at.cmp(&other.wake_at).then_with(|| self.key.cmp(&other.key))
    }
}

/// Per-key trigger state machine: `Absent -> Scheduled -> {Firing ->
/// [Absent | Scheduled]}`. Must be driven with `Arc::clone`d handles; the
/// background task holds only a `Weak` one so the manager is collected
/// once nothing else references it and its heap has drained.
pub struct ScheduledTriggerManager {
    nodes: SccHashMap<String, Arc<StdMutex<TriggerNode>>>,
    heap: StdMutex<BinaryHeap<Reverse<HeapEntry>>>,
    wake: Notify,
    minimum_forward_scheduling: DurationCell,
    trigger_delay: DurationCell,
}

impl ScheduledTriggerManager {
    /// Construct the manager and start its background task. The task
    /// exits once the returned `Arc` (and all clones) are dropped and the
    /// heap is empty.
    pub fn spawn(config: SchedulerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            nodes: SccHashMap::new(),
            heap: StdMutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            minimum_forward_scheduling: DurationCell::new(config.minimum_forward_scheduling),
            trigger_delay: DurationCell::new(config.trigger_delay),
        });
        tokio::spawn(Self::run(Arc::downgrade(&manager)));
        manager
    }

    /// Current floor on how soon a newly computed trigger may fire.
    pub fn minimum_forward_scheduling(&self) -> Duration {
        self.minimum_forward_scheduling.get()
    }

    /// spec.md §4.6 lists this as mutable post-construction; adjusts the
    /// floor used by every `ensure_scheduled`/rearm computed from now on.
    pub fn set_minimum_forward_scheduling(&self, value: Duration) {
        self.minimum_forward_scheduling.set(value);
    }

    /// Current slack added to every heap wakeup.
    pub fn trigger_delay(&self) -> Duration {
        self.trigger_delay.get()
    }

    /// spec.md §4.6 lists this as mutable post-construction; adjusts the
    /// slack applied to wakeups scheduled from now on (already-pushed
    /// heap entries keep the padding they were pushed with).
    pub fn set_trigger_delay(&self, value: Duration) {
        self.trigger_delay.set(value);
    }

    /// §4.5 `ensure_scheduled`. A no-op if a trigger for `key` already
    /// exists. `prev_callback_start_utc` anchors the target at
    /// `prev_callback_start_utc + interval`, clamped forward by
    /// `minimum_forward_scheduling`.
    pub fn ensure_scheduled(
        &self,
        key: &str,
        prev_callback_start_utc: DateTime<Utc>,
        inactive_retention: Duration,
        interval: Duration,
        callback: TriggerCallback,
        trace_id: Option<String>,
    ) {
        if self.nodes.read(key, |_, _| ()).is_some() {
            return;
        }

        let now = Instant::now();
        let elapsed = Utc::now()
            .signed_duration_since(prev_callback_start_utc)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let naive_target = now + interval.saturating_sub(elapsed);
        let target = naive_target.max(now + self.minimum_forward_scheduling.get());

        let node = Arc::new(StdMutex::new(TriggerNode {
            generation: 0,
            target_callback_time: target,
            last_active: now,
            inactive_retention,
            interval,
            callback,
            trace_id,
        }));

        if self.nodes.insert(key.to_string(), node).is_err() {
            return; // lost the race to a concurrent ensure_scheduled
        }

        self.push_heap(key.to_string(), target, 0);
    }

    /// §4.5 `update_last_activity`. Returns whether a trigger exists for
    /// `key`. The original's "repeat the probe" race guard is specific to
    /// a host TTL map whose own reads can trigger expiry side effects;
    /// this scheduler's reads never do that, so a single probe suffices.
    pub fn update_last_activity(&self, key: &str) -> bool {
        let node = self.nodes.read(key, |_, node| Arc::clone(node));
        match node {
            Some(node) => {
                node.lock().unwrap().last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    fn push_heap(&self, key: String, target: Instant, generation: u64) {
        let wake_at = target + self.trigger_delay.get();
        self.heap.lock().unwrap().push(Reverse(HeapEntry {
            wake_at,
            key,
            generation,
        }));
        self.wake.notify_one();
    }

    async fn run(weak: Weak<Self>) {
        loop {
            let Some(this) = weak.upgrade() else { return };

            let next_wake = this.heap.lock().unwrap().peek().map(|Reverse(e)| e.wake_at);

            match next_wake {
                Some(wake_at) if wake_at <= Instant::now() => {
                    let due = this.heap.lock().unwrap().pop();
                    if let Some(Reverse(entry)) = due {
                        this.fire(entry).await;
                    }
                }
                Some(wake_at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake_at) => {}
                        _ = this.wake.notified() => {}
                    }
                }
                None => {
                    this.wake.notified().await;
                }
            }
        }
    }

    /// The removed-callback (§4.5): decide whether the key's schedule
    /// survives, re-arm or retire it, then invoke the trigger callback on
    /// its own task so this loop's recursion depth never grows.
    async fn fire(&self, entry: HeapEntry) {
        let HeapEntry { key, generation, .. } = entry;

        let Some(node) = self.nodes.read(&key, |_, node| Arc::clone(node)) else {
            return;
        };

        let outcome = {
            let mut guard = node.lock().unwrap();
            if guard.generation != generation {
                None // stale entry from a generation already superseded
            } else {
                let now = Instant::now();
                let alive = now < guard.last_active + guard.inactive_retention;
                let trace_id = guard.trace_id.clone();
                if alive {
                    let next_target = (guard.target_callback_time + guard.interval)
                        .max(now + self.minimum_forward_scheduling.get());
                    guard.generation += 1;
                    guard.target_callback_time = next_target;
                    Some((true, guard.generation, next_target, Arc::clone(&guard.callback), trace_id))
                } else {
                    Some((false, guard.generation, now, Arc::clone(&guard.callback), trace_id))
                }
            }
        };

        let Some((rearm, new_generation, next_target, callback, trace_id)) = outcome else {
            return;
        };

        if rearm {
            tracing::debug!(key = %key, trace_id = trace_id.as_deref().unwrap_or(""), "re-arming trigger");
            self.push_heap(key, next_target, new_generation);
            tokio::spawn(async move { callback().await });
        } else {
            tracing::debug!(key = %key, trace_id = trace_id.as_deref().unwrap_or(""), "trigger retired after inactive retention elapsed");
            let _ = self.nodes.remove(&key);
        }
    }
}
