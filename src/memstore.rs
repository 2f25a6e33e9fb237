//! In-memory delta store of a rowset.
//!
//! Records updates, deletes and reinserts applied to a rowset's immutable
//! base data until they are flushed to a delta file.
//!
//! # Write path
//!
//! `update` copies the change list into the store's arena, inserts it into
//! the concurrent delta tree and anchors the write-ahead log at the update's
//! index, so the log is retained until the store is flushed.
//!
//! Mutations of the same row at the same timestamp (several updates in one
//! batch) get a disambiguator from a store-wide counter so they sort after
//! the earlier ones instead of colliding.
//!
//! # Concurrency
//!
//! One writer at a time calls `update`; any number of readers iterate
//! concurrently and never block it. `flush_to_file` freezes the store first,
//! after which `update` fails with `Error::Frozen`.

use crate::arena::{Arena, MemTracker};
use crate::changelist::RowChangeListDecoder;
use crate::config::DeltaStoreConfig;
use crate::delta::{DeltaFileWriter, DeltaKey, DeltaStats, DeltaStatsCollector, DeltaTree, RowId};
use crate::error::{Error, Result};
use crate::hybrid_time::HybridTime;
use crate::iterator::DmsIterator;
use crate::log_anchor::{LogAnchorRegistry, MinLogIndexAnchorer, OpId};
use crate::mvcc::MvccSnapshot;
use crate::schema::Schema;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const NO_TIMESTAMP: u64 = u64::MAX;

struct Inner {
    id: i64,
    rowset_id: i64,
    config: DeltaStoreConfig,
    mem_tracker: Arc<MemTracker>,
    arena: Arena,
    tree: DeltaTree,
    anchorer: MinLogIndexAnchorer,
    // always empty; flushed statistics are returned by flush_to_file
    delta_stats: DeltaStats,
    disambiguator_sequence_number: AtomicU32,
    min_timestamp: AtomicU64,
    // held by update and freeze so a freeze never races an in-flight update
    write_gate: Mutex<()>,
    frozen: AtomicBool,
}

/// Handle to a delta memstore. Clones share the same store; iterators hold
/// one, which keeps the arena alive for as long as they run.
#[derive(Clone)]
pub struct DeltaMemStore {
    inner: Arc<Inner>,
}

impl DeltaMemStore {
    pub fn new(id: i64, rowset_id: i64, log_anchor_registry: Arc<LogAnchorRegistry>) -> Self {
        Self::with_config(
            id,
            rowset_id,
            log_anchor_registry,
            DeltaStoreConfig::default(),
            None,
        )
    }

    pub fn with_config(
        id: i64,
        rowset_id: i64,
        log_anchor_registry: Arc<LogAnchorRegistry>,
        config: DeltaStoreConfig,
        parent_tracker: Option<Arc<MemTracker>>,
    ) -> Self {
        let tracker_id = format!("DeltaMemStore-{}", id);
        let mem_tracker = match parent_tracker {
            Some(parent) => MemTracker::with_parent(tracker_id, config.memory_limit, parent),
            None => MemTracker::new(tracker_id, config.memory_limit),
        };
        let arena = Arena::with_tracker(
            config.arena_chunk_size,
            config.arena_max_chunk_size,
            Some(mem_tracker.clone()),
        );
        let anchorer = MinLogIndexAnchorer::new(
            log_anchor_registry,
            format!("Rowset-{}/DeltaMemStore-{}", rowset_id, id),
        );

        tracing::debug!(dms_id = id, rowset_id = rowset_id, "Created delta memstore");

        Self {
            inner: Arc::new(Inner {
                id,
                rowset_id,
                config,
                mem_tracker,
                arena,
                tree: DeltaTree::new(),
                anchorer,
                delta_stats: DeltaStats::new(),
                disambiguator_sequence_number: AtomicU32::new(0),
                min_timestamp: AtomicU64::new(NO_TIMESTAMP),
                write_gate: Mutex::new(()),
                frozen: AtomicBool::new(false),
            }),
        }
    }

    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    pub fn initted(&self) -> bool {
        true
    }

    /// Records `changelist` against `row_idx` at `timestamp`.
    ///
    /// Updates to the same row must arrive in non-decreasing timestamp order.
    pub fn update(
        &self,
        timestamp: HybridTime,
        row_idx: RowId,
        changelist: &[u8],
        op_id: &OpId,
    ) -> Result<()> {
        if timestamp == HybridTime::MAX {
            return Err(Error::InvalidArgument(format!(
                "{} is reserved and cannot stamp a mutation",
                timestamp
            )));
        }
        RowChangeListDecoder::new(changelist)?.validate()?;

        let _gate = self.inner.write_gate.lock()?;
        if self.inner.frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }

        let mut key = DeltaKey::new(row_idx, timestamp);
        if self.inner.tree.contains(&key) {
            // Same row, same timestamp: order after the existing delta.
            let seq = self
                .inner
                .disambiguator_sequence_number
                .fetch_add(1, Ordering::SeqCst)
                + 1;
            key = DeltaKey::with_disambiguator(row_idx, timestamp, seq);
        }

        let payload = self.inner.arena.allocate(changelist)?;
        // the log must be anchored before the delta becomes visible
        self.inner.anchorer.anchor_if_minimum(op_id.index)?;
        // published before the entry so readers never skip a visible delta
        self.inner
            .min_timestamp
            .fetch_min(timestamp.value(), Ordering::SeqCst);
        self.inner.tree.insert(key, payload)?;
        Ok(())
    }

    /// Stops accepting updates. Fails if the store is already frozen.
    pub fn freeze(&self) -> Result<()> {
        let _gate = self.inner.write_gate.lock()?;
        if self.inner.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        tracing::debug!(dms_id = self.inner.id, "Froze delta memstore");
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Writes every delta to `writer` in key order and returns the flushed
    /// statistics. The store is frozen first if it is not already.
    pub fn flush_to_file<W>(&self, writer: &mut W) -> Result<DeltaStats>
    where
        W: DeltaFileWriter + ?Sized,
    {
        {
            let _gate = self.inner.write_gate.lock()?;
            self.inner.frozen.store(true, Ordering::SeqCst);
        }

        let mut collector = DeltaStatsCollector::new();
        for (key, changelist) in self.inner.tree.iter() {
            if let Err(e) = collector.update_stats(&key, &changelist) {
                tracing::error!(
                    dms_id = self.inner.id,
                    key = %key,
                    error = %e,
                    "Corrupt change list in delta memstore"
                );
                return Err(e);
            }
            writer.append_delta(&key, &changelist)?;
        }
        let stats = collector.finish();
        writer.write_delta_stats(&stats)?;

        tracing::info!(
            dms_id = self.inner.id,
            rowset_id = self.inner.rowset_id,
            rows = stats.rows_touched(),
            updates = stats.total_update_count(),
            deletes = stats.delete_count(),
            "Flushed delta memstore"
        );
        Ok(stats)
    }

    /// Creates an iterator over the deltas visible in `snapshot`.
    ///
    /// Returns `Error::NotFound` when nothing in this store can be visible in
    /// `snapshot`; callers treat that as an empty store.
    pub fn new_delta_iterator(
        &self,
        projection: Arc<Schema>,
        snapshot: MvccSnapshot,
    ) -> Result<DmsIterator> {
        let min_timestamp = self.inner.min_timestamp.load(Ordering::SeqCst);
        if min_timestamp == NO_TIMESTAMP
            || !snapshot.may_have_committed_at_or_after(HybridTime::new(min_timestamp))
        {
            tracing::debug!(
                dms_id = self.inner.id,
                snapshot = %snapshot,
                "No deltas visible in snapshot"
            );
            return Err(Error::NotFound(format!(
                "{} has no deltas visible in {}",
                self, snapshot
            )));
        }
        Ok(DmsIterator::new(self.clone(), projection, snapshot))
    }

    /// Whether the latest delete or reinsert of `row_idx` is a delete.
    pub fn check_row_deleted(&self, row_idx: RowId) -> Result<bool> {
        self.row_deleted(row_idx, None)
    }

    /// Like `check_row_deleted`, considering only deltas visible in `snapshot`.
    pub fn check_row_deleted_in_snapshot(
        &self,
        row_idx: RowId,
        snapshot: &MvccSnapshot,
    ) -> Result<bool> {
        self.row_deleted(row_idx, Some(snapshot))
    }

    fn row_deleted(&self, row_idx: RowId, snapshot: Option<&MvccSnapshot>) -> Result<bool> {
        let mut deleted = false;
        for (key, changelist) in self.inner.tree.row_entries(row_idx) {
            if let Some(snap) = snapshot {
                if !snap.is_committed(key.timestamp()) {
                    continue;
                }
            }
            let decoder = RowChangeListDecoder::new(&changelist)?;
            if decoder.is_delete() {
                deleted = true;
            } else if decoder.is_reinsert() {
                deleted = false;
            }
        }
        Ok(deleted)
    }

    pub fn estimate_size(&self) -> u64 {
        self.memory_footprint() as u64
    }

    pub fn memory_footprint(&self) -> usize {
        self.inner.arena.memory_footprint()
    }

    pub fn needs_flush(&self) -> bool {
        self.memory_footprint() >= self.inner.config.flush_threshold
    }

    /// Earliest log index this store depends on, if it holds any delta.
    pub fn min_log_index(&self) -> Option<u64> {
        self.inner.anchorer.minimum_log_index()
    }

    pub fn count(&self) -> usize {
        self.inner.tree.count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tree.is_empty()
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    pub fn rowset_id(&self) -> i64 {
        self.inner.rowset_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.inner.mem_tracker
    }

    pub fn delta_stats(&self) -> &DeltaStats {
        &self.inner.delta_stats
    }

    /// Logs every delta at debug level. Only meaningful while no writer runs.
    pub fn debug_print(&self) {
        for (key, changelist) in self.inner.tree.iter() {
            tracing::debug!(
                dms_id = self.inner.id,
                "{} {}",
                key,
                crate::changelist::debug_string(&changelist)
            );
        }
    }

    pub(crate) fn tree(&self) -> &DeltaTree {
        &self.inner.tree
    }
}

impl fmt::Display for DeltaMemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMS")
    }
}

impl fmt::Debug for DeltaMemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaMemStore")
            .field("id", &self.inner.id)
            .field("rowset_id", &self.inner.rowset_id)
            .field("count", &self.count())
            .field("footprint", &self.memory_footprint())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
