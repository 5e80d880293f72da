//! Per-entry aggregate counters and the merge ("observe") logic.
//!
//! Everything here is branch-light arithmetic: `observe` runs under the
//! entry's own lock and must not allocate or block, so the histogram is
//! the only heap-backed field and is sized once at entry creation.

use serde::{Deserialize, Serialize};

use crate::config::HistogramConfig;
use crate::error::{Result, StoreError};
use crate::model::sample::{
    BlockSample, CpuSample, ErrorSample, ExecutionSample, JitSample, WalSample, PHASE_COUNT,
    MAX_ERROR_MESSAGE_LEN,
};

/// Usage credit granted per observation. Only eviction passes decay it.
pub const USAGE_INIT: f64 = 1.0;

/// Welford-style running aggregate for one statement phase.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CallTiming {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    /// Sum of squared deviations from the running mean.
    pub sum_sq_dev: f64,
}

impl CallTiming {
    /// Folds one sample into the aggregate.
    pub fn observe(&mut self, x: f64) {
        self.count += 1;
        self.total_ms += x;
        if self.count == 1 {
            self.min_ms = x;
            self.max_ms = x;
            self.mean_ms = x;
            self.sum_sq_dev = 0.0;
            return;
        }
        if x < self.min_ms {
            self.min_ms = x;
        }
        if x > self.max_ms {
            self.max_ms = x;
        }
        let delta = x - self.mean_ms;
        self.mean_ms += delta / self.count as f64;
        self.sum_sq_dev += delta * (x - self.mean_ms);
    }

    /// Population variance, 0 for fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.sum_sq_dev / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Call-level totals plus the decaying popularity score the evictor reads.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CallCounts {
    pub calls: u64,
    pub rows: u64,
    pub usage: f64,
}

/// Buffer I/O totals for shared, local and temp storage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockCounters {
    pub shared_hit: u64,
    pub shared_read: u64,
    pub shared_dirtied: u64,
    pub shared_written: u64,
    pub local_hit: u64,
    pub local_read: u64,
    pub local_dirtied: u64,
    pub local_written: u64,
    pub temp_read: u64,
    pub temp_written: u64,
    pub read_time_ms: f64,
    pub write_time_ms: f64,
    pub temp_read_time_ms: f64,
    pub temp_write_time_ms: f64,
}

impl BlockCounters {
    fn add(&mut self, s: &BlockSample) {
        self.shared_hit = self.shared_hit.saturating_add(s.shared_hit);
        self.shared_read = self.shared_read.saturating_add(s.shared_read);
        self.shared_dirtied = self.shared_dirtied.saturating_add(s.shared_dirtied);
        self.shared_written = self.shared_written.saturating_add(s.shared_written);
        self.local_hit = self.local_hit.saturating_add(s.local_hit);
        self.local_read = self.local_read.saturating_add(s.local_read);
        self.local_dirtied = self.local_dirtied.saturating_add(s.local_dirtied);
        self.local_written = self.local_written.saturating_add(s.local_written);
        self.temp_read = self.temp_read.saturating_add(s.temp_read);
        self.temp_written = self.temp_written.saturating_add(s.temp_written);
        self.read_time_ms += s.read_time_ms;
        self.write_time_ms += s.write_time_ms;
        self.temp_read_time_ms += s.temp_read_time_ms;
        self.temp_write_time_ms += s.temp_write_time_ms;
    }
}

/// WAL generation totals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WalCounters {
    pub records: u64,
    pub full_page_images: u64,
    pub bytes: u64,
}

impl WalCounters {
    fn add(&mut self, s: &WalSample) {
        self.records = self.records.saturating_add(s.records);
        self.full_page_images = self.full_page_images.saturating_add(s.full_page_images);
        self.bytes = self.bytes.saturating_add(s.bytes);
    }
}

/// JIT totals. Stage counts track how many executions spent any time in
/// that stage, matching how the server reports them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JitCounters {
    pub functions: u64,
    pub generation_time_ms: f64,
    pub inlining_count: u64,
    pub inlining_time_ms: f64,
    pub optimization_count: u64,
    pub optimization_time_ms: f64,
    pub emission_count: u64,
    pub emission_time_ms: f64,
}

impl JitCounters {
    fn add(&mut self, s: &JitSample) {
        self.functions = self.functions.saturating_add(s.functions);
        self.generation_time_ms += s.generation_time_ms;
        if s.inlining_time_ms > 0.0 {
            self.inlining_count = self.inlining_count.saturating_add(1);
        }
        self.inlining_time_ms += s.inlining_time_ms;
        if s.optimization_time_ms > 0.0 {
            self.optimization_count = self.optimization_count.saturating_add(1);
        }
        self.optimization_time_ms += s.optimization_time_ms;
        if s.emission_time_ms > 0.0 {
            self.emission_count = self.emission_count.saturating_add(1);
        }
        self.emission_time_ms += s.emission_time_ms;
    }
}

/// Backend CPU time totals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CpuCounters {
    pub user_ms: f64,
    pub system_ms: f64,
}

impl CpuCounters {
    fn add(&mut self, s: &CpuSample) {
        self.user_ms += s.user_ms;
        self.system_ms += s.system_ms;
    }
}

/// Snapshot of the most recent error for this statistic. Overwritten on
/// every errored execution, never aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LastError {
    pub severity: crate::model::sample::ErrorSeverity,
    pub sqlstate: String,
    pub message: String,
}

impl LastError {
    fn from_sample(s: &ErrorSample) -> Self {
        Self {
            severity: s.severity,
            sqlstate: s.sqlstate.clone(),
            message: crate::model::sample::truncate_to_boundary(&s.message, MAX_ERROR_MESSAGE_LEN)
                .to_string(),
        }
    }
}

/// Full aggregate state of one table entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryCounters {
    pub calls: CallCounts,
    /// Per-phase timing, indexed by [`StatementPhase::index`](crate::model::StatementPhase::index).
    pub timings: [CallTiming; PHASE_COUNT],
    pub blocks: BlockCounters,
    pub wal: WalCounters,
    pub jit: JitCounters,
    pub cpu: CpuCounters,
    pub last_error: Option<LastError>,
    /// Latency distribution of exec-phase samples.
    pub response_histogram: Vec<u64>,
}

impl EntryCounters {
    pub fn new(histogram_buckets: usize) -> Self {
        Self {
            response_histogram: vec![0; histogram_buckets],
            ..Self::default()
        }
    }

    /// Merges one execution sample. Arithmetic only; runs under the
    /// entry's lock.
    pub fn observe(&mut self, sample: &ExecutionSample, histogram: &HistogramConfig) {
        self.calls.calls = self.calls.calls.saturating_add(1);
        self.calls.rows = self.calls.rows.saturating_add(sample.rows);
        self.calls.usage += USAGE_INIT;

        self.timings[sample.phase.index()].observe(sample.duration_ms);
        if sample.phase == crate::model::StatementPhase::Exec {
            let idx = histogram.index_for(sample.duration_ms);
            if let Some(slot) = self.response_histogram.get_mut(idx) {
                *slot = slot.saturating_add(1);
            }
        }

        self.blocks.add(&sample.blocks);
        self.wal.add(&sample.wal);
        self.jit.add(&sample.jit);
        self.cpu.add(&sample.cpu);

        if let Some(err) = &sample.error {
            self.last_error = Some(LastError::from_sample(err));
        }
    }

    /// Invariant check on a live entry: at least one call, finite means,
    /// ordered min/mean/max per phase.
    pub fn check_invariants(&self) -> Result<()> {
        if self.calls.calls == 0 {
            return Err(StoreError::CorruptState {
                reason: "live entry with zero calls",
            });
        }
        if !self.calls.usage.is_finite() || self.calls.usage < 0.0 {
            return Err(StoreError::CorruptState {
                reason: "usage score out of range",
            });
        }
        for t in &self.timings {
            if t.count == 0 {
                continue;
            }
            if !t.mean_ms.is_finite() || !t.total_ms.is_finite() {
                return Err(StoreError::CorruptState {
                    reason: "non-finite timing aggregate",
                });
            }
            // Tiny epsilon absorbs accumulated floating-point error.
            let eps = 1e-9 * t.max_ms.abs().max(1.0);
            if t.min_ms > t.mean_ms + eps || t.mean_ms > t.max_ms + eps {
                return Err(StoreError::CorruptState {
                    reason: "timing min/mean/max out of order",
                });
            }
        }
        Ok(())
    }

    /// Zeroes the aggregate in place, keeping the histogram shape.
    pub fn reset(&mut self) {
        let buckets = self.response_histogram.len();
        *self = EntryCounters::new(buckets);
    }
}

/// Fixed portion of one entry's footprint, used to derive the entry-count
/// ceiling from the configured byte budget.
pub fn base_entry_bytes() -> usize {
    std::mem::size_of::<EntryCounters>() + std::mem::size_of::<crate::model::StatsKey>()
}
