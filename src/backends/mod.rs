//! Reference collaborator backends.
//!
//! Host applications bind [`crate::external::ExternalCache`],
//! [`crate::external::DistributedLockFactory`] and
//! [`crate::external::FanOutBus`] to a real store (Redis, etcd, NATS, ...).
//! This module supplies an in-process emulation of all three for tests,
//! examples, and single-process use.

pub mod memory;
