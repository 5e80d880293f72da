//! Data model: composite statistics key, input samples, aggregate counters.

pub mod counters;
pub mod sample;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

pub use counters::{
    BlockCounters, CallCounts, CallTiming, CpuCounters, EntryCounters, JitCounters, LastError,
    WalCounters,
};
pub use sample::{
    BlockSample, CommandType, CpuSample, ErrorSample, ErrorSeverity, ExecutionSample, JitSample,
    QueryMetadata, QueryOrigin, StatementPhase, WalSample,
};

/// Derives a stable 64-bit id from a label such as an application name or
/// client address. Matches the hashing the snapshot interner uses, so ids
/// are comparable across restarts.
pub fn hash_label(label: &str) -> u64 {
    xxh3_64(label.as_bytes())
}

/// Composite identity of one aggregate entry.
///
/// Two executions contribute to the same statistic iff every field matches.
/// `bucket_id` ties an entry to exactly one time window: the same logical
/// query gets a distinct entry per window, which is what makes wholesale
/// reclamation of a window possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatsKey {
    /// Monotonic bucket (time window) id assigned by the rotator.
    pub bucket_id: u64,
    /// Stable query fingerprint from the normalization layer.
    pub query_id: u64,
    /// Database user id.
    pub user_id: u64,
    /// Database id.
    pub database_id: u64,
    /// Hash of the client address, or 0 for local connections.
    pub client_ip_hash: u64,
    /// Plan fingerprint, or 0 when plan tracking is off.
    pub plan_id: u64,
    /// Hash of the application name.
    pub app_id_hash: u64,
    /// Whether the statement ran at top level (not nested).
    pub top_level: bool,
}

impl StatsKey {
    /// Builds the full key from a caller-supplied origin plus the current
    /// bucket id.
    pub fn new(bucket_id: u64, origin: &QueryOrigin) -> Self {
        Self {
            bucket_id,
            query_id: origin.query_id,
            user_id: origin.user_id,
            database_id: origin.database_id,
            client_ip_hash: origin.client_ip_hash,
            plan_id: origin.plan_id,
            app_id_hash: origin.app_id_hash,
            top_level: origin.top_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_label_stable() {
        assert_eq!(hash_label("psql"), hash_label("psql"));
        assert_ne!(hash_label("psql"), hash_label("pgbench"));
    }

    #[test]
    fn test_key_identity_per_bucket() {
        let origin = QueryOrigin {
            query_id: 42,
            ..QueryOrigin::default()
        };
        let a = StatsKey::new(0, &origin);
        let b = StatsKey::new(0, &origin);
        let c = StatsKey::new(1, &origin);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
