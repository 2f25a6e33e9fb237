//! Concurrent ordered index of deltas.
//!
//! Backed by `crossbeam_skiplist::SkipMap`, which publishes each node with a
//! single atomic link update: readers never block the writer and never see a
//! half-inserted entry. Entries are never modified or removed once inserted.
//!
//! Readers walk the index with a `TreeCursor`, which remembers only the last
//! key it returned. Each step re-enters the skip list from that key, so a
//! cursor holds no borrow on the tree and can live inside an iterator that
//! owns the store. Entries inserted ahead of a cursor may or may not be seen;
//! callers filter them by timestamp.

use super::key::{DeltaKey, RowId};
use crate::error::{Error, Result};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

#[derive(Default)]
pub struct DeltaTree {
    map: SkipMap<DeltaKey, Bytes>,
}

impl DeltaTree {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
        }
    }

    /// Inserts a new entry. Keys are unique; a second insert of the same key
    /// is a caller bug and fails with `AlreadyPresent`.
    ///
    /// Must only be called from the single writer.
    pub fn insert(&self, key: DeltaKey, value: Bytes) -> Result<()> {
        if self.map.contains_key(&key) {
            return Err(Error::AlreadyPresent(format!(
                "delta key {} already in tree",
                key
            )));
        }
        self.map.insert(key, value);
        Ok(())
    }

    pub fn contains(&self, key: &DeltaKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (DeltaKey, Bytes)> + '_ {
        self.map.iter().map(|e| (*e.key(), e.value().clone()))
    }

    /// Entries of a single row, oldest first.
    pub fn row_entries(&self, row_idx: RowId) -> impl Iterator<Item = (DeltaKey, Bytes)> + '_ {
        let start = Bound::Included(DeltaKey::min_for_row(row_idx));
        let end = match row_idx.checked_add(1) {
            Some(next) => Bound::Excluded(DeltaKey::min_for_row(next)),
            None => Bound::Unbounded,
        };
        self.map
            .range((start, end))
            .map(|e| (*e.key(), e.value().clone()))
    }

    /// Smallest key in the tree.
    pub fn first_key(&self) -> Option<DeltaKey> {
        self.map.front().map(|e| *e.key())
    }

    pub fn cursor(&self) -> TreeCursor {
        TreeCursor {
            position: Bound::Unbounded,
        }
    }
}

/// Position in a `DeltaTree`, expressed as a lower bound on the next key.
#[derive(Debug, Clone)]
pub struct TreeCursor {
    position: Bound<DeltaKey>,
}

impl TreeCursor {
    /// Positions at the first key `>= key`.
    pub fn seek(&mut self, key: DeltaKey) {
        self.position = Bound::Included(key);
    }

    /// Entry at the cursor, without moving it.
    pub fn peek(&self, tree: &DeltaTree) -> Option<(DeltaKey, Bytes)> {
        tree.map
            .lower_bound(self.position.as_ref())
            .map(|e| (*e.key(), e.value().clone()))
    }

    /// Moves past `key`, normally the key just returned by `peek`.
    pub fn advance_past(&mut self, key: DeltaKey) {
        self.position = Bound::Excluded(key);
    }

    pub fn is_valid(&self, tree: &DeltaTree) -> bool {
        self.peek(tree).is_some()
    }
}
