//! Store configuration and startup validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Upper bound on the bucket ring. Keeps per-slot bookkeeping arrays small.
pub const MAX_RING_SLOTS: usize = 10;
/// Upper bound on response-time histogram resolution.
pub const MAX_HISTOGRAM_BUCKETS: usize = 50;
/// Shortest query-text prefix worth storing when truncating on overflow.
pub const MIN_QUERY_LEN: usize = 10;

/// What to do when a query text does not fit into its arena segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Store the longest prefix that still fits (at least [`MIN_QUERY_LEN`]
    /// bytes, on a char boundary).
    #[default]
    Truncate,
    /// Record the entry without any text.
    Omit,
}

/// Bounds for the per-entry response-time histogram.
///
/// Latency samples are mapped linearly from `[min_ms, max_ms]` onto
/// `bucket_count` slots and clamped at both ends, so out-of-range samples
/// land in the first or last slot rather than being lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    pub min_ms: f64,
    pub max_ms: f64,
    pub bucket_count: usize,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            min_ms: 0.0,
            max_ms: 100_000.0,
            bucket_count: 10,
        }
    }
}

impl HistogramConfig {
    /// Maps one latency sample to its bucket index, clamped to
    /// `[0, bucket_count - 1]`.
    pub fn index_for(&self, latency_ms: f64) -> usize {
        if latency_ms <= self.min_ms {
            return 0;
        }
        if latency_ms >= self.max_ms {
            return self.bucket_count - 1;
        }
        let span = self.max_ms - self.min_ms;
        let idx = ((latency_ms - self.min_ms) / span * self.bucket_count as f64) as usize;
        idx.min(self.bucket_count - 1)
    }
}

/// Configuration for a [`StatsStore`](crate::store::StatsStore).
///
/// All sizes are fixed at construction; the store never grows or shrinks
/// its shared structures at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Wall-clock length of one bucket (time window).
    pub bucket_duration: Duration,
    /// Number of bucket slots retained before the oldest is reused.
    pub ring_size: usize,
    /// Byte budget for aggregate entries; the entry-count ceiling is
    /// derived from it.
    pub bucket_memory_bytes: usize,
    /// Total size of the out-of-line query/plan text region, split evenly
    /// across the ring slots.
    pub query_buffer_bytes: usize,
    /// Response-time histogram bounds.
    pub histogram: HistogramConfig,
    /// Overflow behavior for the text arena.
    pub overflow_policy: OverflowPolicy,
    /// Whether plan text supplied with a sample is captured.
    pub capture_plans: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket_duration: Duration::from_secs(60),
            ring_size: MAX_RING_SLOTS,
            bucket_memory_bytes: 100 * 1024 * 1024,
            query_buffer_bytes: 20 * 1024 * 1024,
            histogram: HistogramConfig::default(),
            overflow_policy: OverflowPolicy::default(),
            capture_plans: false,
        }
    }
}

impl StoreConfig {
    /// Validates the configuration. Any error here is fatal to store
    /// construction; nothing else in the store reports `InvalidConfig`.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_duration < Duration::from_secs(1) {
            return Err(StoreError::InvalidConfig(
                "bucket_duration must be at least one second".into(),
            ));
        }
        if self.ring_size == 0 || self.ring_size > MAX_RING_SLOTS {
            return Err(StoreError::InvalidConfig(format!(
                "ring_size must be in 1..={MAX_RING_SLOTS}, got {}",
                self.ring_size
            )));
        }
        if self.max_entries() == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "bucket_memory_bytes {} is smaller than one entry",
                self.bucket_memory_bytes
            )));
        }
        if self.segment_bytes() < MIN_QUERY_LEN {
            return Err(StoreError::InvalidConfig(format!(
                "query_buffer_bytes {} leaves no room for text per slot",
                self.query_buffer_bytes
            )));
        }
        let h = &self.histogram;
        if h.bucket_count < 2 || h.bucket_count > MAX_HISTOGRAM_BUCKETS {
            return Err(StoreError::InvalidConfig(format!(
                "histogram bucket_count must be in 2..={MAX_HISTOGRAM_BUCKETS}, got {}",
                h.bucket_count
            )));
        }
        if !h.min_ms.is_finite() || !h.max_ms.is_finite() || h.min_ms >= h.max_ms {
            return Err(StoreError::InvalidConfig(format!(
                "histogram range [{}, {}] is not a valid interval",
                h.min_ms, h.max_ms
            )));
        }
        Ok(())
    }

    /// Hard ceiling on entry count: byte budget divided by the estimated
    /// per-entry footprint.
    pub fn max_entries(&self) -> usize {
        self.bucket_memory_bytes / self.approx_entry_bytes()
    }

    /// Estimated in-memory footprint of one entry, including its
    /// heap-allocated histogram.
    pub fn approx_entry_bytes(&self) -> usize {
        crate::model::counters::base_entry_bytes() + self.histogram.bucket_count * 8
    }

    /// Bytes of text arena backing one bucket slot.
    pub fn segment_bytes(&self) -> usize {
        self.query_buffer_bytes / self.ring_size
    }

    pub fn bucket_duration_ms(&self) -> i64 {
        self.bucket_duration.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_ring() {
        let cfg = StoreConfig {
            ring_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_ring() {
        let cfg = StoreConfig {
            ring_size: MAX_RING_SLOTS + 1,
            ..StoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_memory_budget() {
        let cfg = StoreConfig {
            bucket_memory_bytes: 16,
            ..StoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_histogram_range() {
        let cfg = StoreConfig {
            histogram: HistogramConfig {
                min_ms: 100.0,
                max_ms: 10.0,
                bucket_count: 10,
            },
            ..StoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_histogram_index_clamps() {
        let h = HistogramConfig {
            min_ms: 10.0,
            max_ms: 110.0,
            bucket_count: 10,
        };
        assert_eq!(h.index_for(-5.0), 0);
        assert_eq!(h.index_for(10.0), 0);
        assert_eq!(h.index_for(1e9), 9);
        assert_eq!(h.index_for(110.0), 9);
        // 60ms is halfway through [10, 110] -> bucket 5
        assert_eq!(h.index_for(60.0), 5);
    }

    #[test]
    fn test_histogram_index_monotonic() {
        let h = HistogramConfig::default();
        let mut prev = 0;
        for ms in (0..200_000).step_by(997) {
            let idx = h.index_for(ms as f64);
            assert!(idx >= prev);
            prev = idx;
        }
    }
}
