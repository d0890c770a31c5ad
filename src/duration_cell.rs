//! A small interior-mutable duration holder.
//!
//! spec.md §4.6 lists `cache_expiry_tolerance_seconds`, `farm_clock_tolerance_seconds`,
//! `minimum_forward_scheduling_seconds` and `trigger_delay_seconds` as
//! "construction + mutable properties" — a host application may adjust
//! them on a live [`crate::manager::RegenerativeCacheManager`] or
//! [`crate::scheduler::ScheduledTriggerManager`] that background tasks
//! are concurrently reading. An `AtomicU64` of milliseconds gives that
//! without a lock; sub-millisecond precision is not meaningful for these
//! knobs (they are specified in whole seconds).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct DurationCell(AtomicU64);

impl DurationCell {
    pub fn new(initial: Duration) -> Self {
        Self(AtomicU64::new(initial.as_millis() as u64))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: Duration) {
        self.0.store(value.as_millis() as u64, Ordering::Relaxed);
    }
}
