//! Capacity-pressure eviction: approximate aging LFU over a bounded sample.
//!
//! An exact global LRU would need a full scan serialized against every
//! writer, so the policy is deliberately approximate: each pass decays
//! every sampled entry's usage score multiplicatively and removes the
//! lowest-scored entries until a fixed fraction of the ceiling is free.
//! Entries in the currently active bucket decay more gently, so recent
//! work outlives stale windows.

use tracing::debug;

use crate::model::StatsKey;
use crate::store::table::EntryMap;

/// Per-pass decay for entries in already-rotated buckets.
pub const USAGE_DECAY_STALE: f64 = 0.50;
/// Per-pass decay for sticky entries (currently active bucket).
pub const USAGE_DECAY_ACTIVE: f64 = 0.99;
/// Fraction of the ceiling to free per pass, in percent.
pub const DEALLOC_PERCENT: usize = 5;
/// At most this many entries are scored per pass.
pub const SAMPLE_LIMIT: usize = 4096;

struct Victim {
    key: StatsKey,
    usage: f64,
    bucket_id: u64,
    calls: u64,
}

/// Runs one eviction pass over `map`. Called with the structural write
/// lock held, so entry locks are uncontended and each is held only for
/// the decay and score read.
///
/// Returns the number of entries removed; strictly positive whenever the
/// map is non-empty.
pub(crate) fn run(map: &mut EntryMap, current_bucket: u64, max_entries: usize) -> usize {
    if map.is_empty() {
        return 0;
    }
    let target = (max_entries * DEALLOC_PERCENT / 100).max(1);

    let mut scored: Vec<Victim> = Vec::with_capacity(map.len().min(SAMPLE_LIMIT));
    for (key, handle) in map.iter().take(SAMPLE_LIMIT) {
        let mut entry = handle.lock();
        let decay = if key.bucket_id == current_bucket {
            USAGE_DECAY_ACTIVE
        } else {
            USAGE_DECAY_STALE
        };
        entry.counters.calls.usage *= decay;
        scored.push(Victim {
            key: *key,
            usage: entry.counters.calls.usage,
            bucket_id: key.bucket_id,
            calls: entry.counters.calls.calls,
        });
    }

    // Lowest usage first; ties go to the older bucket, then to the entry
    // with fewer calls.
    scored.sort_by(|a, b| {
        a.usage
            .total_cmp(&b.usage)
            .then(a.bucket_id.cmp(&b.bucket_id))
            .then(a.calls.cmp(&b.calls))
    });

    let mut removed = 0;
    for victim in scored.iter().take(target) {
        if map.remove(&victim.key).is_some() {
            removed += 1;
        }
    }
    debug!(removed, target, remaining = map.len(), "eviction pass");
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::model::{EntryCounters, QueryMetadata, QueryOrigin};
    use crate::store::table::Entry;

    fn key(bucket: u64, query: u64) -> StatsKey {
        StatsKey::new(
            bucket,
            &QueryOrigin {
                query_id: query,
                ..QueryOrigin::default()
            },
        )
    }

    fn entry(usage: f64, calls: u64) -> Arc<Mutex<Entry>> {
        let mut counters = EntryCounters::new(4);
        counters.calls.usage = usage;
        counters.calls.calls = calls;
        Arc::new(Mutex::new(Entry {
            counters,
            query_text: None,
            plan_text: None,
            info: QueryMetadata::default(),
        }))
    }

    #[test]
    fn test_pass_strictly_shrinks_nonempty_map() {
        let mut map = EntryMap::new();
        for q in 0..10 {
            map.insert(key(0, q), entry(1.0, 1));
        }
        let before = map.len();
        let removed = run(&mut map, 0, 10);
        assert!(removed >= 1);
        assert!(map.len() < before);
    }

    #[test]
    fn test_empty_map_is_noop() {
        let mut map = EntryMap::new();
        assert_eq!(run(&mut map, 0, 10), 0);
    }

    #[test]
    fn test_lowest_usage_goes_first() {
        let mut map = EntryMap::new();
        map.insert(key(5, 1), entry(10.0, 100));
        map.insert(key(5, 2), entry(0.1, 100));
        run(&mut map, 5, 2); // target = 1
        assert!(!map.contains_key(&key(5, 2)));
        assert!(map.contains_key(&key(5, 1)));
    }

    #[test]
    fn test_stale_bucket_decays_faster_than_active() {
        let mut map = EntryMap::new();
        // Equal usage going in; the stale-bucket entry decays harder and
        // loses the tie.
        map.insert(key(9, 1), entry(1.0, 5)); // active bucket
        map.insert(key(2, 2), entry(1.0, 5)); // stale bucket
        run(&mut map, 9, 2);
        assert!(map.contains_key(&key(9, 1)));
        assert!(!map.contains_key(&key(2, 2)));
    }

    #[test]
    fn test_tie_break_older_bucket_then_fewer_calls() {
        let mut map = EntryMap::new();
        // All stale, identical usage after decay.
        map.insert(key(3, 1), entry(1.0, 50));
        map.insert(key(1, 2), entry(1.0, 50)); // oldest bucket -> first out
        map.insert(key(3, 3), entry(1.0, 2));
        let removed = run(&mut map, 9, 20); // target = 1
        assert_eq!(removed, 1);
        assert!(!map.contains_key(&key(1, 2)));
    }

    #[test]
    fn test_survivor_usage_decayed() {
        let mut map = EntryMap::new();
        map.insert(key(0, 1), entry(1.0, 1));
        map.insert(key(3, 2), entry(8.0, 1));
        run(&mut map, 3, 2);
        let survivor = map.get(&key(3, 2)).unwrap();
        let usage = survivor.lock().counters.calls.usage;
        assert!((usage - 8.0 * USAGE_DECAY_ACTIVE).abs() < 1e-12);
    }
}
