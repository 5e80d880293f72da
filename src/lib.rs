//! pgqstat — time-bucketed per-query execution statistics with bounded memory.
//!
//! Concurrent workers feed per-statement samples (timing, rows, buffer I/O,
//! WAL, JIT, errors) into one shared [`StatsStore`]; a monitoring reader
//! pulls recent and historical aggregates back out via [`StatsStore::snapshot`].
//! Statistics are rotated through a fixed ring of time windows ("buckets"),
//! evicted under capacity pressure by a decaying-usage policy, and query
//! text lives out of line in a bucket-partitioned arena.
//!
//! Modules:
//! - `config` — store configuration and validation
//! - `error` — error taxonomy (`StoreError`)
//! - `model` — keys, input samples, aggregate counters
//! - `store` — the store itself: table, rotator, evictor, text arena
//!
//! Normalization, execution hooks and any SQL-facing surface are the
//! caller's concern: the store receives a stable query id plus canonical
//! text and exposes plain Rust snapshots.

pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use config::{HistogramConfig, OverflowPolicy, StoreConfig};
pub use error::{Result, StoreError};
pub use model::{
    hash_label, CommandType, EntryCounters, ErrorSample, ErrorSeverity, ExecutionSample,
    QueryMetadata, QueryOrigin, StatementPhase, StatsKey,
};
pub use store::{EntrySnapshot, StatsStore, StoreStats, TextLocator};
