//! The concurrent, fixed-capacity statistics table.
//!
//! Two-tier locking: a structural `RwLock` around the map for insert,
//! remove and traversal, and a per-entry `Mutex` for counter merges. Two
//! writers touching different entries never contend; writers on the same
//! entry serialize only for the merge arithmetic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StoreError};
use crate::model::{EntryCounters, QueryMetadata, StatsKey};
use crate::store::arena::TextLocator;

/// One aggregate entry. Owned by the table; handed out behind an `Arc`
/// so readers reference it without owning it.
#[derive(Debug)]
pub(crate) struct Entry {
    pub counters: EntryCounters,
    pub query_text: Option<TextLocator>,
    pub plan_text: Option<TextLocator>,
    pub info: QueryMetadata,
}

pub(crate) type EntryHandle = Arc<Mutex<Entry>>;
pub(crate) type EntryMap = HashMap<StatsKey, EntryHandle>;

pub(crate) struct StatsTable {
    map: RwLock<EntryMap>,
    max_entries: usize,
}

impl StatsTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn lookup(&self, key: &StatsKey) -> Option<EntryHandle> {
        self.map.read().get(key).cloned()
    }

    /// Finds the entry for `key`, inserting a fresh one when absent.
    ///
    /// At-most-one-entry-per-key under races: the first writer to take
    /// the write lock inserts, a concurrent loser re-finds the winner's
    /// entry and proceeds to update it.
    ///
    /// At the capacity ceiling the supplied `evict` pass runs once under
    /// the write lock; if the table is still full afterwards the call
    /// fails with `CapacityExceeded` and the caller drops the
    /// observation. Returns `(handle, created, evicted)`.
    pub fn find_or_insert_with(
        &self,
        key: StatsKey,
        make_entry: impl FnOnce() -> Entry,
        evict: impl FnOnce(&mut EntryMap) -> usize,
    ) -> Result<(EntryHandle, bool, usize)> {
        if let Some(handle) = self.lookup(&key) {
            return Ok((handle, false, 0));
        }

        let mut map = self.map.write();
        // Double-check: another writer may have inserted while we waited.
        if let Some(handle) = map.get(&key) {
            return Ok((Arc::clone(handle), false, 0));
        }

        let mut evicted = 0;
        if map.len() >= self.max_entries {
            evicted = evict(&mut map);
            if map.len() >= self.max_entries {
                return Err(StoreError::CapacityExceeded { entries: map.len() });
            }
        }

        let handle = Arc::new(Mutex::new(make_entry()));
        map.insert(key, Arc::clone(&handle));
        Ok((handle, true, evicted))
    }

    /// Finite traversal under the structural read lock. Point mutations
    /// through entry handles proceed concurrently; structural changes
    /// wait out the visit.
    pub fn for_each(&self, mut visitor: impl FnMut(&StatsKey, &EntryHandle)) {
        let map = self.map.read();
        for (key, handle) in map.iter() {
            visitor(key, handle);
        }
    }

    pub fn remove(&self, key: &StatsKey) -> Option<EntryHandle> {
        self.map.write().remove(key)
    }

    /// Removes every entry failing the predicate; returns how many went.
    pub fn retain(&self, mut pred: impl FnMut(&StatsKey) -> bool) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|key, _| pred(key));
        before - map.len()
    }

    pub fn clear(&self) -> usize {
        let mut map = self.map.write();
        let n = map.len();
        map.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}
