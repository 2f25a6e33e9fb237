//! Bump allocation for change-list payloads.
//!
//! Payload bytes are copied into large chunks and handed out as `Bytes`
//! views. A view keeps its chunk alive, so nothing is freed per delta: a
//! chunk goes away only once the store and every iterator slice referencing
//! it are dropped. Chunks grow geometrically up to a configured maximum.
//!
//! Every chunk is charged against an optional `MemTracker` hierarchy so the
//! caller's memory-pressure policy can reject or flush before the process
//! runs out of memory.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Hierarchical memory accounting.
///
/// Consumption is charged to the tracker and to each of its ancestors; a
/// charge that would exceed any limit along the chain is refused as a whole.
pub struct MemTracker {
    id: String,
    limit: Option<usize>,
    consumption: AtomicUsize,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    pub fn new(id: impl Into<String>, limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            limit,
            consumption: AtomicUsize::new(0),
            parent: None,
        })
    }

    pub fn with_parent(
        id: impl Into<String>,
        limit: Option<usize>,
        parent: Arc<MemTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            limit,
            consumption: AtomicUsize::new(0),
            parent: Some(parent),
        })
    }

    /// Charges `bytes` to this tracker and its ancestors. Returns false and
    /// charges nothing if any tracker in the chain would go over its limit.
    pub fn try_consume(&self, bytes: usize) -> bool {
        let previous = self.consumption.fetch_add(bytes, Ordering::SeqCst);
        if let Some(limit) = self.limit {
            if previous + bytes > limit {
                self.consumption.fetch_sub(bytes, Ordering::SeqCst);
                return false;
            }
        }
        if let Some(parent) = &self.parent {
            if !parent.try_consume(bytes) {
                self.consumption.fetch_sub(bytes, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    pub fn release(&self, bytes: usize) {
        self.consumption.fetch_sub(bytes, Ordering::SeqCst);
        if let Some(parent) = &self.parent {
            parent.release(bytes);
        }
    }

    pub fn consumption(&self) -> usize {
        self.consumption.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }
}

impl fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTracker")
            .field("id", &self.id)
            .field("limit", &self.limit)
            .field("consumption", &self.consumption())
            .finish()
    }
}

struct ArenaState {
    current: BytesMut,
    next_chunk_size: usize,
}

/// Thread-safe bump arena. Allocation takes a short lock; reading an
/// allocated slice never does.
pub struct Arena {
    state: Mutex<ArenaState>,
    max_chunk_size: usize,
    footprint: AtomicUsize,
    tracker: Option<Arc<MemTracker>>,
}

impl Arena {
    pub fn new(initial_chunk_size: usize, max_chunk_size: usize) -> Self {
        Self::with_tracker(initial_chunk_size, max_chunk_size, None)
    }

    pub fn with_tracker(
        initial_chunk_size: usize,
        max_chunk_size: usize,
        tracker: Option<Arc<MemTracker>>,
    ) -> Self {
        let initial = initial_chunk_size.max(1);
        Self {
            state: Mutex::new(ArenaState {
                current: BytesMut::new(),
                next_chunk_size: initial,
            }),
            max_chunk_size: max_chunk_size.max(initial),
            footprint: AtomicUsize::new(0),
            tracker,
        }
    }

    /// Copies `data` into the arena and returns a view of the copy.
    pub fn allocate(&self, data: &[u8]) -> Result<Bytes> {
        let mut state = self.state.lock()?;
        if state.current.capacity() < data.len() {
            let chunk_size = state.next_chunk_size.max(data.len());
            if let Some(tracker) = &self.tracker {
                if !tracker.try_consume(chunk_size) {
                    return Err(Error::ResourceExhausted(format!(
                        "arena chunk of {} bytes exceeds limit of tracker '{}'",
                        chunk_size,
                        tracker.id()
                    )));
                }
            }
            self.footprint.fetch_add(chunk_size, Ordering::SeqCst);
            state.current = BytesMut::with_capacity(chunk_size);
            state.next_chunk_size = (state.next_chunk_size * 2).min(self.max_chunk_size);
        }
        state.current.extend_from_slice(data);
        Ok(state.current.split().freeze())
    }

    /// Total bytes reserved by the arena's chunks. Never decreases.
    pub fn memory_footprint(&self) -> usize {
        self.footprint.load(Ordering::SeqCst)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.release(self.footprint.load(Ordering::SeqCst));
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("footprint", &self.memory_footprint())
            .field("max_chunk_size", &self.max_chunk_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_copies_bytes() {
        let arena = Arena::new(64, 1024);
        let a = arena.allocate(b"hello").unwrap();
        let b = arena.allocate(b"world").unwrap();
        assert_eq!(&a[..], b"hello");
        assert_eq!(&b[..], b"world");
        // both fit in the first chunk
        assert_eq!(arena.memory_footprint(), 64);
    }

    #[test]
    fn test_chunks_grow_and_footprint_is_monotonic() {
        let arena = Arena::new(8, 32);
        let mut last = 0;
        let mut slices = Vec::new();
        for i in 0..50u8 {
            slices.push(arena.allocate(&[i; 6]).unwrap());
            let footprint = arena.memory_footprint();
            assert!(footprint >= last);
            last = footprint;
        }
        for (i, slice) in slices.iter().enumerate() {
            assert_eq!(&slice[..], &[i as u8; 6]);
        }
    }

    #[test]
    fn test_oversized_allocation_gets_its_own_chunk() {
        let arena = Arena::new(8, 16);
        let big = vec![7u8; 100];
        let slice = arena.allocate(&big).unwrap();
        assert_eq!(slice.len(), 100);
        assert_eq!(arena.memory_footprint(), 100);
    }

    #[test]
    fn test_tracker_limit() {
        let tracker = MemTracker::new("dms", Some(100));
        let arena = Arena::with_tracker(64, 64, Some(tracker.clone()));
        arena.allocate(&[0u8; 60]).unwrap();
        assert_eq!(tracker.consumption(), 64);

        let err = arena.allocate(&[0u8; 60]).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert_eq!(tracker.consumption(), 64);
    }

    #[test]
    fn test_tracker_released_on_drop() {
        let parent = MemTracker::new("server", None);
        let child = MemTracker::with_parent("dms", None, parent.clone());
        {
            let arena = Arena::with_tracker(128, 128, Some(child.clone()));
            arena.allocate(b"abc").unwrap();
            assert_eq!(child.consumption(), 128);
            assert_eq!(parent.consumption(), 128);
        }
        assert_eq!(child.consumption(), 0);
        assert_eq!(parent.consumption(), 0);
    }

    #[test]
    fn test_parent_limit_rolls_back_child() {
        let parent = MemTracker::new("server", Some(10));
        let child = MemTracker::with_parent("dms", None, parent.clone());
        assert!(!child.try_consume(11));
        assert_eq!(child.consumption(), 0);
        assert_eq!(parent.consumption(), 0);
        assert!(child.try_consume(10));
        assert_eq!(parent.consumption(), 10);
    }

    #[test]
    fn test_slices_outlive_arena() {
        let slice = {
            let arena = Arena::new(16, 16);
            arena.allocate(b"kept").unwrap()
        };
        assert_eq!(&slice[..], b"kept");
    }
}
