//! Crate-wide error type.
//!
//! Every failure mode the coordination engine can surface to a caller, or
//! that it logs from its own background tasks, funnels through this enum —
//! one `thiserror`-derived type rather than each module inventing its own,
//! the same shape a host application's own error module takes.

use thiserror::Error;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller's `generate` callback returned an error. Carries the
    /// message from the `Notification` that reported the failure.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// A peer (or this node) reported a successful regeneration, but the
    /// entry had already expired by the time it was read back. Indicates
    /// an inactive-retention/interval misconfiguration rather than a
    /// transient failure.
    #[error("generation raced: entry for key {0:?} expired before it could be read back")]
    GenerationRaced(String),

    /// The external key/value store collaborator failed.
    #[error("external store error: {0}")]
    ExternalStore(String),

    /// The distributed lock collaborator failed.
    #[error("lock service error: {0}")]
    LockService(String),

    /// The fan-out bus collaborator failed.
    #[error("bus error: {0}")]
    Bus(String),

    /// A stored `"<timestamp>;<payload>"` entry could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A type alias for `Result<T, Error>` to simplify function signatures.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes specific to the timestamped-value codec (encode/decode of
/// `"<ISO-8601>;<payload>"` cache entries).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No `;` separator was found anywhere in the input.
    #[error("no separator found in encoded entry")]
    MissingSeparator,

    /// A `;` was found, but not within the `[20, 50]` byte window the
    /// format reserves for the timestamp prefix.
    #[error("separator at byte {0} falls outside the [20, 50] timestamp window")]
    SeparatorOutOfRange(usize),

    /// The timestamp prefix was not a valid RFC 3339 / ISO 8601 instant.
    #[error("timestamp prefix is not valid RFC 3339: {0}")]
    InvalidTimestamp(String),
}
