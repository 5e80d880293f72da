//! Out-of-line text arena for query and plan text.
//!
//! One byte region, sized at construction, split into `ring_size` equal
//! segments. Each segment is an append-only cursor belonging to one bucket
//! slot, so space comes back only when the rotator reuses that slot —
//! there is no in-place compaction. Locators are global offsets into the
//! region and are never shared between entries: every insertion writes its
//! own copy, which is what lets a whole window's text die with its slot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{OverflowPolicy, MIN_QUERY_LEN};
use crate::error::{Result, StoreError};
use crate::model::sample::truncate_to_boundary;

/// Stable handle to one stored text: a byte range inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLocator {
    pub offset: usize,
    pub len: usize,
}

struct ArenaInner {
    buf: Vec<u8>,
    /// Write cursor per slot, relative to the slot's segment start.
    cursors: Vec<usize>,
}

/// Append-oriented shared text store.
pub struct TextArena {
    inner: Mutex<ArenaInner>,
    segment_bytes: usize,
    ring_size: usize,
}

impl TextArena {
    pub fn new(total_bytes: usize, ring_size: usize) -> Self {
        let segment_bytes = total_bytes / ring_size;
        Self {
            inner: Mutex::new(ArenaInner {
                buf: vec![0; segment_bytes * ring_size],
                cursors: vec![0; ring_size],
            }),
            segment_bytes,
            ring_size,
        }
    }

    /// Appends `text` into the segment owned by `slot`. Fails with
    /// `TextOverflow` when the segment cannot hold it.
    pub fn allocate(&self, slot: usize, text: &[u8]) -> Result<TextLocator> {
        debug_assert!(slot < self.ring_size);
        let mut inner = self.inner.lock();
        let cursor = inner.cursors[slot];
        let available = self.segment_bytes - cursor;
        if text.len() > available {
            return Err(StoreError::TextOverflow {
                requested: text.len(),
                available,
            });
        }
        let offset = slot * self.segment_bytes + cursor;
        inner.buf[offset..offset + text.len()].copy_from_slice(text);
        inner.cursors[slot] = cursor + text.len();
        Ok(TextLocator {
            offset,
            len: text.len(),
        })
    }

    /// Appends `text`, degrading per `policy` when it does not fit whole.
    ///
    /// Returns the locator (full or truncated) or `None` when the text is
    /// omitted — either the policy says so or even the minimum useful
    /// prefix does not fit. The second element reports whether an
    /// overflow happened at all, so the caller can count it.
    pub fn allocate_with_policy(
        &self,
        slot: usize,
        text: &str,
        policy: OverflowPolicy,
    ) -> (Option<TextLocator>, bool) {
        match self.allocate(slot, text.as_bytes()) {
            Ok(loc) => (Some(loc), false),
            Err(StoreError::TextOverflow { available, .. }) => match policy {
                OverflowPolicy::Omit => (None, true),
                OverflowPolicy::Truncate => {
                    if available < MIN_QUERY_LEN {
                        return (None, true);
                    }
                    let prefix = truncate_to_boundary(text, available);
                    // The prefix fits by construction.
                    (self.allocate(slot, prefix.as_bytes()).ok(), true)
                }
            },
            Err(_) => (None, true),
        }
    }

    /// Copies the bytes behind a locator out of the arena.
    pub fn resolve(&self, locator: TextLocator) -> Vec<u8> {
        let inner = self.inner.lock();
        inner.buf[locator.offset..locator.offset + locator.len].to_vec()
    }

    /// Resolves a locator as lossy UTF-8.
    pub fn resolve_str(&self, locator: TextLocator) -> String {
        String::from_utf8_lossy(&self.resolve(locator)).into_owned()
    }

    /// Resets one slot's segment when the rotator reuses it. All locators
    /// into that segment are dead from this point on; the rotator purges
    /// their entries in the same transition.
    pub fn reclaim_slot(&self, slot: usize) {
        debug_assert!(slot < self.ring_size);
        self.inner.lock().cursors[slot] = 0;
    }

    /// Resets every segment.
    pub fn reclaim_all(&self) {
        let mut inner = self.inner.lock();
        for c in inner.cursors.iter_mut() {
            *c = 0;
        }
    }

    /// Bytes currently appended across all segments.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().cursors.iter().sum()
    }

    pub fn segment_bytes(&self) -> usize {
        self.segment_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_and_resolve() {
        let arena = TextArena::new(1024, 2);
        let loc = arena.allocate(0, b"SELECT 1").unwrap();
        assert_eq!(arena.resolve_str(loc), "SELECT 1");
    }

    #[test]
    fn test_locators_never_overlap_sequentially() {
        let arena = TextArena::new(1024, 2);
        let a = arena.allocate(0, b"aaaa").unwrap();
        let b = arena.allocate(0, b"bbbb").unwrap();
        let c = arena.allocate(1, b"cccc").unwrap();
        assert!(a.offset + a.len <= b.offset);
        // Slot 1 lives in its own segment.
        assert!(c.offset >= arena.segment_bytes());
        assert_eq!(arena.resolve_str(a), "aaaa");
        assert_eq!(arena.resolve_str(b), "bbbb");
    }

    #[test]
    fn test_locators_never_overlap_concurrently() {
        let arena = Arc::new(TextArena::new(64 * 1024, 2));
        let mut handles = Vec::new();
        for t in 0..8 {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                let payload = vec![b'a' + t as u8; 33];
                let mut locs = Vec::new();
                for _ in 0..100 {
                    locs.push(arena.allocate(t % 2, &payload).unwrap());
                }
                locs
            }));
        }
        let mut all: Vec<TextLocator> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_by_key(|l| l.offset);
        for pair in all.windows(2) {
            assert!(pair[0].offset + pair[0].len <= pair[1].offset);
        }
    }

    #[test]
    fn test_overflow_reported() {
        let arena = TextArena::new(40, 2); // 20 bytes per segment
        let err = arena.allocate(0, &[0u8; 21]).unwrap_err();
        assert!(matches!(err, StoreError::TextOverflow { available: 20, .. }));
    }

    #[test]
    fn test_truncate_policy_stores_prefix() {
        let arena = TextArena::new(40, 2);
        let text = "SELECT * FROM big_table WHERE id = $1";
        let (loc, overflowed) = arena.allocate_with_policy(0, text, OverflowPolicy::Truncate);
        assert!(overflowed);
        let loc = loc.unwrap();
        assert_eq!(loc.len, 20);
        assert_eq!(arena.resolve_str(loc), &text[..20]);
    }

    #[test]
    fn test_omit_policy_drops_text() {
        let arena = TextArena::new(40, 2);
        let text = "SELECT * FROM big_table WHERE id = $1";
        let (loc, overflowed) = arena.allocate_with_policy(0, text, OverflowPolicy::Omit);
        assert!(overflowed);
        assert!(loc.is_none());
    }

    #[test]
    fn test_truncate_gives_up_below_min_len() {
        let arena = TextArena::new(40, 2);
        arena.allocate(0, &[b'x'; 15]).unwrap(); // 5 bytes left < MIN_QUERY_LEN
        let (loc, overflowed) =
            arena.allocate_with_policy(0, "SELECT something", OverflowPolicy::Truncate);
        assert!(overflowed);
        assert!(loc.is_none());
    }

    #[test]
    fn test_reclaim_slot_resets_cursor() {
        let arena = TextArena::new(40, 2);
        arena.allocate(0, &[b'x'; 20]).unwrap();
        assert!(arena.allocate(0, b"0123456789").is_err());
        arena.reclaim_slot(0);
        assert_eq!(arena.bytes_used(), 0);
        assert!(arena.allocate(0, b"0123456789").is_ok());
    }
}
