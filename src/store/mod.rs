//! The statistics store: a time-bucketed, capacity-bounded aggregate table.
//!
//! Each observed execution is keyed by [`StatsKey`] (with the bucket id
//! supplied by the rotator), folded into a shared entry under a narrow
//! per-entry lock, and its query text stored out of line in the arena.
//! Rotation and eviction keep memory bounded: the rotator recycles the
//! oldest window when its slot is reused, the evictor frees headroom when
//! the table hits its ceiling.
//!
//! Per-observation failures never reach the caller; they are counted and
//! surfaced through [`StatsStore::stats`].

pub mod arena;
pub mod bucket;
pub mod evict;
pub mod table;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::model::sample::MAX_PLAN_TEXT_LEN;
use crate::model::{
    CommandType, EntryCounters, ExecutionSample, QueryMetadata, QueryOrigin, StatsKey,
};
use arena::TextArena;
use bucket::{BucketRotator, Rotation};
use table::{Entry, StatsTable};

pub use arena::TextLocator;

/// Point-in-time copy of one entry for the reporting layer. Consistent
/// per entry (copied under its lock), not transactional across entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub counters: EntryCounters,
    /// Canonical query text, if captured. `None` after an arena overflow
    /// under the `Omit` policy.
    pub query_text: Option<String>,
    pub plan_text: Option<String>,
    pub encoding_id: i32,
    pub application_name: String,
    pub relations: Vec<String>,
    pub cmd_type: CommandType,
    pub comments: String,
    /// Start of the entry's window, epoch milliseconds.
    pub bucket_start_ms: i64,
}

/// Aggregate observability counters for the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub max_entries: usize,
    /// Estimated bytes held by aggregate entries.
    pub bytes_used: usize,
    /// Bytes appended in the text arena.
    pub text_bytes_used: usize,
    /// Text captures that overflowed (truncated or omitted).
    pub overflow_count: u64,
    /// Entries removed by capacity-pressure eviction.
    pub eviction_count: u64,
    /// Observations dropped because the table stayed full after eviction.
    pub dropped_count: u64,
    /// Entries reset after a failed invariant check.
    pub corrupt_count: u64,
    /// Live entries per ring slot.
    pub bucket_entries: Vec<u64>,
}

#[derive(Default)]
struct StoreCounters {
    overflow: AtomicU64,
    evictions: AtomicU64,
    dropped: AtomicU64,
    corrupt: AtomicU64,
}

/// Shared statistics store. All methods take `&self`; the store is meant
/// to sit behind an `Arc` and be hit from many worker threads at once.
pub struct StatsStore {
    config: StoreConfig,
    table: StatsTable,
    rotator: BucketRotator,
    arena: TextArena,
    counters: StoreCounters,
}

impl StatsStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::new_at(config, Utc::now())
    }

    /// Construction with an explicit clock, for deterministic tests.
    pub fn new_at(config: StoreConfig, now: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let table = StatsTable::new(config.max_entries());
        let rotator = BucketRotator::new(
            config.bucket_duration_ms(),
            config.ring_size,
            now.timestamp_millis(),
        );
        let arena = TextArena::new(config.query_buffer_bytes, config.ring_size);
        Ok(Self {
            config,
            table,
            rotator,
            arena,
            counters: StoreCounters::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Records one completed statement phase. Never fails: capacity and
    /// text problems are absorbed into the stats counters.
    pub fn record_execution(
        &self,
        origin: &QueryOrigin,
        meta: &QueryMetadata,
        sample: &ExecutionSample,
    ) {
        self.record_execution_at(origin, meta, sample, Utc::now());
    }

    /// [`record_execution`](Self::record_execution) with an explicit clock.
    pub fn record_execution_at(
        &self,
        origin: &QueryOrigin,
        meta: &QueryMetadata,
        sample: &ExecutionSample,
        now: DateTime<Utc>,
    ) {
        let now_ms = now.timestamp_millis();
        if let Some(rotation) = self.rotator.check(now_ms) {
            self.apply_rotation(rotation);
        }
        let bucket = self.rotator.current();
        let key = StatsKey::new(bucket, origin);

        let result = self.table.find_or_insert_with(
            key,
            || self.make_entry(bucket, meta),
            |map| evict::run(map, bucket, self.table.max_entries()),
        );

        match result {
            Ok((handle, _created, evicted)) => {
                if evicted > 0 {
                    self.counters
                        .evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
                let mut entry = handle.lock();
                entry.counters.observe(sample, &self.config.histogram);
                if let Err(err) = entry.counters.check_invariants() {
                    // Contain the damage: zero the entry and re-seed it
                    // with the current sample so it stays live. The
                    // failure never propagates to the statement path.
                    warn!(%err, query_id = key.query_id, "corrupt aggregate state, entry reset");
                    entry.counters.reset();
                    entry.counters.observe(sample, &self.config.histogram);
                    self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(StoreError::CapacityExceeded { entries }) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(entries, "table full after eviction, observation dropped");
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "observation dropped");
            }
        }
    }

    /// Builds a fresh entry, capturing query (and optionally plan) text
    /// into the arena segment of the entry's bucket.
    fn make_entry(&self, bucket: u64, meta: &QueryMetadata) -> Entry {
        let slot = self.rotator.slot_of(bucket);
        let mut overflowed = false;

        let query_text = if meta.query_text.is_empty() {
            None
        } else {
            let (loc, of) =
                self.arena
                    .allocate_with_policy(slot, &meta.query_text, self.config.overflow_policy);
            overflowed |= of;
            loc
        };

        let plan_text = match (&meta.plan_text, self.config.capture_plans) {
            (Some(plan), true) if !plan.is_empty() => {
                let bounded = crate::model::sample::truncate_to_boundary(plan, MAX_PLAN_TEXT_LEN);
                let (loc, of) =
                    self.arena
                        .allocate_with_policy(slot, bounded, self.config.overflow_policy);
                overflowed |= of;
                loc
            }
            _ => None,
        };

        if overflowed {
            self.counters.overflow.fetch_add(1, Ordering::Relaxed);
        }

        Entry {
            counters: EntryCounters::new(self.config.histogram.bucket_count),
            query_text,
            plan_text,
            info: meta.bounded(),
        }
    }

    /// Winner-side rotation work: purge every entry still keyed to a
    /// previous occupant of the reused slot, reset that slot's text
    /// segment, then publish the new id. The ordering matters: a writer
    /// that saw the new id before the segment reset could have its fresh
    /// text wiped, so the id stays hidden until the slot is clean.
    /// Skipped windows whose slots were not reused stay until their
    /// slot's turn comes; staleness filtering hides them meanwhile.
    fn apply_rotation(&self, rotation: Rotation) {
        let ring = self.rotator.ring_size();
        let slot = rotation.reused_slot as u64;
        let new_bucket = rotation.new_bucket;
        let removed = self
            .table
            .retain(|key| key.bucket_id % ring != slot || key.bucket_id == new_bucket);
        self.arena.reclaim_slot(rotation.reused_slot);
        self.rotator.publish(rotation);
        if removed > 0 {
            debug!(removed, slot, new_bucket, "reclaimed bucket slot");
        }
    }

    /// Point lookup. An entry whose bucket has rolled out of the ring is
    /// treated as not found.
    pub fn lookup(&self, key: &StatsKey) -> Option<EntrySnapshot> {
        self.rotator.ensure_live(key.bucket_id).ok()?;
        let handle = self.table.lookup(key)?;
        Some(self.snapshot_entry(key, &handle))
    }

    /// Copies out all live entries. Finite and restartable; each snapshot
    /// is internally consistent, the set as a whole is not transactional.
    pub fn snapshot(&self) -> Vec<(StatsKey, EntrySnapshot)> {
        self.snapshot_filtered(|_| true)
    }

    /// Copies out the live entries of one bucket.
    pub fn snapshot_bucket(&self, bucket_id: u64) -> Vec<(StatsKey, EntrySnapshot)> {
        self.snapshot_filtered(|key| key.bucket_id == bucket_id)
    }

    fn snapshot_filtered(
        &self,
        mut pred: impl FnMut(&StatsKey) -> bool,
    ) -> Vec<(StatsKey, EntrySnapshot)> {
        let mut out = Vec::new();
        self.table.for_each(|key, handle| {
            if self.rotator.is_live(key.bucket_id) && pred(key) {
                out.push((*key, self.snapshot_entry(key, handle)));
            }
        });
        out
    }

    fn snapshot_entry(&self, key: &StatsKey, handle: &table::EntryHandle) -> EntrySnapshot {
        let entry = handle.lock();
        EntrySnapshot {
            counters: entry.counters.clone(),
            query_text: entry.query_text.map(|loc| self.arena.resolve_str(loc)),
            plan_text: entry.plan_text.map(|loc| self.arena.resolve_str(loc)),
            encoding_id: entry.info.encoding_id,
            application_name: entry.info.application_name.clone(),
            relations: entry.info.relations.clone(),
            cmd_type: entry.info.cmd_type,
            comments: entry.info.comments.clone(),
            bucket_start_ms: self.rotator.slot_start_ms(self.rotator.slot_of(key.bucket_id)),
        }
    }

    /// Clears one window, or everything. Arena space for a single window
    /// is only reclaimed when its slot is reused; a full reset releases
    /// the whole region.
    pub fn reset(&self, bucket_id: Option<u64>) {
        match bucket_id {
            Some(id) => {
                let removed = self.table.retain(|key| key.bucket_id != id);
                debug!(removed, bucket_id = id, "bucket reset");
            }
            None => {
                let removed = self.table.clear();
                self.arena.reclaim_all();
                debug!(removed, "full reset");
            }
        }
    }

    /// Current bucket id, as the next observation would see it.
    pub fn current_bucket(&self) -> u64 {
        self.rotator.current()
    }

    /// Start time of the window occupying `slot`, if it has ever been used.
    pub fn bucket_start(&self, slot: usize) -> Option<DateTime<Utc>> {
        let ms = self.rotator.slot_start_ms(slot);
        if ms == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(ms).single()
    }

    /// Observability aggregate for the monitoring surface.
    pub fn stats(&self) -> StoreStats {
        let mut bucket_entries = vec![0u64; self.config.ring_size];
        let mut live = 0usize;
        self.table.for_each(|key, _| {
            if self.rotator.is_live(key.bucket_id) {
                live += 1;
                bucket_entries[self.rotator.slot_of(key.bucket_id)] += 1;
            }
        });
        StoreStats {
            entry_count: live,
            max_entries: self.table.max_entries(),
            bytes_used: self.table.len() * self.config.approx_entry_bytes(),
            text_bytes_used: self.arena.bytes_used(),
            overflow_count: self.counters.overflow.load(Ordering::Relaxed),
            eviction_count: self.counters.evictions.load(Ordering::Relaxed),
            dropped_count: self.counters.dropped.load(Ordering::Relaxed),
            corrupt_count: self.counters.corrupt.load(Ordering::Relaxed),
            bucket_entries,
        }
    }
}
