//! Error kinds shared by every component in the crate.
//!
//! `NotAttached` and `OutOfHazardSlots` are caller contract violations and are
//! surfaced as `Err`. Outcomes like an empty container or a duplicate/absent
//! key are semantic results, not faults, and are expressed as a plain
//! `bool`/`Option` return on the container's own API rather than threaded
//! through this enum.

use thiserror::Error;

/// Crate-wide result alias for operations that can fail with a [`CdsError`].
pub type Result<T> = std::result::Result<T, CdsError>;

/// Error conditions a caller can observe from this crate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CdsError {
    /// A thread invoked a container or SMR operation without first calling
    /// `attach()` on the relevant thread registry.
    #[error("thread is not attached to the registry")]
    NotAttached,

    /// A thread requested more simultaneous hazard pointers than its
    /// per-thread quota allows. This is a programmer error, not a transient
    /// condition.
    #[error("hazard pointer quota exhausted for this thread")]
    OutOfHazardSlots,

    /// A flat-combining waiter's wait strategy timed out before the
    /// combiner reached its publication record. The caller should retry.
    #[error("timed out waiting for the combiner")]
    WaitTimedOut,

    /// Every slot in the thread registry is already taken by another
    /// concurrently attached thread. Transient: a caller can retry once a
    /// slot frees up, or the registry can be sized larger via
    /// `registry::init`.
    #[error("thread registry has no free slots (increase max_threads passed to registry::init)")]
    RegistryExhausted,
}
