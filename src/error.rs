//! Error taxonomy for the statistics store.
//!
//! Per-observation failures are deliberately soft: the store counts them
//! and surfaces the counts through `StatsStore::stats()` instead of
//! propagating them to the statement path. The only hard failure is
//! `InvalidConfig`, raised once at construction.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The table is full and an eviction pass could not free headroom.
    /// The observation is dropped and counted, never escalated.
    #[error("statistics table full ({entries} entries), observation dropped")]
    CapacityExceeded { entries: usize },

    /// The text arena segment for the target bucket cannot hold the
    /// requested bytes.
    #[error("text arena overflow: requested {requested} bytes, {available} available")]
    TextOverflow { requested: usize, available: usize },

    /// The entry's bucket id has already rolled out of the retention ring.
    /// Callers treat this as "not found".
    #[error("bucket {bucket_id} already reclaimed (current bucket {current})")]
    StaleBucket { bucket_id: u64, current: u64 },

    /// A defensive invariant check on an entry's aggregates failed.
    /// The entry is reset to zero state rather than propagated.
    #[error("corrupt aggregate state: {reason}")]
    CorruptState { reason: &'static str },

    /// Misconfiguration detected at startup. Fatal to initialization.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
