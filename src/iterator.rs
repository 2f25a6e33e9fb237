//! Iterator over the deltas of a `DeltaMemStore`.
//!
//! The iterator walks the delta tree one batch of rows at a time. Each batch
//! is prepared in one of two modes:
//!
//! - **apply**: visible updates are grouped per projected column so the
//!   caller can apply them column by column (and skip columns whose
//!   predicates already rejected every row). Deletes and reinserts are
//!   queued separately for the selection vector.
//! - **collect**: visible deltas are kept verbatim so they can be copied out
//!   for flushes and compactions, optionally re-projected to fewer columns.
//!
//! Usage: `init`, then `seek_to_ordinal`, then repeatedly `prepare_batch`
//! followed by the operations of the chosen mode.

use crate::arena::Arena;
use crate::changelist::{self, RowChangeListDecoder};
use crate::delta::{DeltaKey, RowId, TreeCursor};
use crate::error::{Error, Result};
use crate::hybrid_time::HybridTime;
use crate::memstore::DeltaMemStore;
use crate::mvcc::MvccSnapshot;
use crate::rowblock::{ColumnBlock, SelectionVector};
use crate::schema::{ColumnId, Schema};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareFlag {
    ForApply,
    ForCollect,
}

/// Row range a scan is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSpec {
    lower_bound_row: Option<RowId>,
    exclusive_upper_bound_row: Option<RowId>,
}

impl ScanSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeks below this row are moved up to it
    pub fn lower_bound_row(mut self, row: RowId) -> Self {
        self.lower_bound_row = Some(row);
        self
    }

    /// Batches never extend to this row or beyond
    pub fn exclusive_upper_bound_row(mut self, row: RowId) -> Self {
        self.exclusive_upper_bound_row = Some(row);
        self
    }
}

/// A delta copied out of the store by `collect_mutations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    timestamp: HybridTime,
    changelist: Bytes,
}

impl Mutation {
    pub fn timestamp(&self) -> HybridTime {
        self.timestamp
    }

    pub fn changelist(&self) -> &[u8] {
        &self.changelist
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{}({})",
            self.timestamp.value(),
            changelist::debug_string(&self.changelist)
        )
    }
}

/// A delta key with its (possibly re-projected) change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaKeyAndUpdate {
    pub key: DeltaKey,
    pub cell: Bytes,
}

impl fmt::Display for DeltaKeyAndUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(delta key={}, change_list={})",
            self.key,
            changelist::debug_string(&self.cell)
        )
    }
}

struct ColumnUpdate {
    row_id: RowId,
    new_value: Option<Bytes>,
}

struct DeleteOrReinsert {
    row_id: RowId,
    exists: bool,
}

struct PreparedDelta {
    key: DeltaKey,
    val: Bytes,
}

enum Prepared {
    None,
    ForApply {
        updates_by_col: Vec<VecDeque<ColumnUpdate>>,
        deletes_and_reinserts: VecDeque<DeleteOrReinsert>,
    },
    ForCollect {
        deltas: VecDeque<PreparedDelta>,
    },
}

impl Prepared {
    fn name(&self) -> &'static str {
        match self {
            Prepared::None => "NOT_PREPARED",
            Prepared::ForApply { .. } => "PREPARED_FOR_APPLY",
            Prepared::ForCollect { .. } => "PREPARED_FOR_COLLECT",
        }
    }
}

pub struct DmsIterator {
    dms: DeltaMemStore,
    projection: Arc<Schema>,
    snapshot: MvccSnapshot,
    cursor: TreeCursor,
    spec: Option<ScanSpec>,
    seeked: bool,
    // first row and number of rows of the last prepared batch
    prepared_idx: u64,
    prepared_count: usize,
    prepared: Prepared,
}

impl DmsIterator {
    pub(crate) fn new(dms: DeltaMemStore, projection: Arc<Schema>, snapshot: MvccSnapshot) -> Self {
        let cursor = dms.tree().cursor();
        Self {
            dms,
            projection,
            snapshot,
            cursor,
            spec: None,
            seeked: false,
            prepared_idx: 0,
            prepared_count: 0,
            prepared: Prepared::None,
        }
    }

    pub fn init(&mut self, spec: ScanSpec) -> Result<()> {
        if self.spec.is_some() {
            return Err(Error::IllegalState("iterator already initialized".to_string()));
        }
        self.spec = Some(spec);
        Ok(())
    }

    pub fn seek_to_ordinal(&mut self, row_idx: RowId) -> Result<()> {
        let spec = self.spec.as_ref().ok_or_else(not_initialized)?;
        let row_idx = spec.lower_bound_row.map_or(row_idx, |lb| row_idx.max(lb));
        self.cursor.seek(DeltaKey::min_for_row(row_idx));
        self.prepared_idx = u64::from(row_idx);
        self.prepared_count = 0;
        self.prepared = Prepared::None;
        self.seeked = true;
        Ok(())
    }

    /// Stages the visible deltas of the next `nrows` rows and returns the
    /// number of rows the batch covers, which is lower than `nrows` only
    /// when the scan's upper bound is reached.
    pub fn prepare_batch(&mut self, nrows: usize, flag: PrepareFlag) -> Result<usize> {
        let spec = self.spec.as_ref().ok_or_else(not_initialized)?;
        if !self.seeked {
            return Err(Error::IllegalState(
                "prepare_batch called before seek_to_ordinal".to_string(),
            ));
        }

        let start_row = self.prepared_idx + self.prepared_count as u64;
        let end_bound = spec
            .exclusive_upper_bound_row
            .map_or(u64::from(RowId::MAX) + 1, u64::from);
        let stop_row = start_row.saturating_add(nrows as u64).min(end_bound).max(start_row);

        let mut prepared = match flag {
            PrepareFlag::ForApply => Prepared::ForApply {
                updates_by_col: (0..self.projection.num_columns())
                    .map(|_| VecDeque::new())
                    .collect(),
                deletes_and_reinserts: VecDeque::new(),
            },
            PrepareFlag::ForCollect => Prepared::ForCollect {
                deltas: VecDeque::new(),
            },
        };
        // drop any previous batch before staging the new one
        self.prepared = Prepared::None;

        // a failed batch leaves the cursor where it started, so nothing is lost
        // when the caller retries or seeks past the bad row
        let resume = self.cursor.clone();
        let tree = self.dms.tree();
        while let Some((key, val)) = self.cursor.peek(tree) {
            let row = u64::from(key.row_idx());
            if row >= stop_row {
                break;
            }
            self.cursor.advance_past(key);
            if row < start_row || !self.snapshot.is_committed(key.timestamp()) {
                continue;
            }
            let staged = match &mut prepared {
                Prepared::ForApply {
                    updates_by_col,
                    deletes_and_reinserts,
                } => stage_for_apply(
                    &self.projection,
                    key,
                    val,
                    updates_by_col,
                    deletes_and_reinserts,
                ),
                Prepared::ForCollect { deltas } => {
                    deltas.push_back(PreparedDelta { key, val });
                    Ok(())
                }
                Prepared::None => Ok(()),
            };
            if let Err(e) = staged {
                tracing::warn!(key = %key, error = %e, "Failed to stage delta");
                self.cursor = resume;
                return Err(e);
            }
        }

        self.prepared_idx = start_row;
        self.prepared_count = (stop_row - start_row) as usize;
        self.prepared = prepared;
        Ok(self.prepared_count)
    }

    /// Writes the staged values of projection column `col_idx` into `dst`,
    /// whose row 0 is the first row of the prepared batch.
    pub fn apply_updates(&self, col_idx: usize, dst: &mut ColumnBlock) -> Result<()> {
        let updates_by_col = match &self.prepared {
            Prepared::ForApply { updates_by_col, .. } => updates_by_col,
            other => return Err(wrong_mode("apply_updates", other)),
        };
        let updates = updates_by_col.get(col_idx).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "column index {} out of range for projection of {} columns",
                col_idx,
                updates_by_col.len()
            ))
        })?;
        self.check_batch_len("column block", dst.nrows())?;
        for update in updates {
            let rel_idx = (u64::from(update.row_id) - self.prepared_idx) as usize;
            dst.set_cell_value(rel_idx, update.new_value.as_deref())?;
        }
        Ok(())
    }

    /// Clears the selection bit of every row whose last staged marker is a
    /// delete, and sets it again for rows whose last marker is a reinsert.
    pub fn apply_deletes(&self, sel_vec: &mut SelectionVector) -> Result<()> {
        let deletes_and_reinserts = match &self.prepared {
            Prepared::ForApply {
                deletes_and_reinserts,
                ..
            } => deletes_and_reinserts,
            other => return Err(wrong_mode("apply_deletes", other)),
        };
        self.check_batch_len("selection vector", sel_vec.nrows())?;
        for marker in deletes_and_reinserts {
            let rel_idx = (u64::from(marker.row_id) - self.prepared_idx) as usize;
            if marker.exists {
                sel_vec.set_row_selected(rel_idx);
            } else {
                sel_vec.set_row_unselected(rel_idx);
            }
        }
        Ok(())
    }

    /// Appends every staged delta, copied into `arena`, to the list of its
    /// row: `dst[0]` is the first row of the prepared batch.
    pub fn collect_mutations(&self, dst: &mut [Vec<Mutation>], arena: &Arena) -> Result<()> {
        let deltas = match &self.prepared {
            Prepared::ForCollect { deltas } => deltas,
            other => return Err(wrong_mode("collect_mutations", other)),
        };
        self.check_batch_len("mutation list", dst.len())?;
        for delta in deltas {
            let rel_idx = (u64::from(delta.key.row_idx()) - self.prepared_idx) as usize;
            dst[rel_idx].push(Mutation {
                timestamp: delta.key.timestamp(),
                changelist: arena.allocate(&delta.val)?,
            });
        }
        Ok(())
    }

    /// Appends the staged deltas restricted to `col_ids`, copied into `arena`.
    /// Updates that touch none of `col_ids` are skipped.
    pub fn filter_column_ids_and_collect_deltas(
        &self,
        col_ids: &[ColumnId],
        out: &mut Vec<DeltaKeyAndUpdate>,
        arena: &Arena,
    ) -> Result<()> {
        let deltas = match &self.prepared {
            Prepared::ForCollect { deltas } => deltas,
            other => return Err(wrong_mode("filter_column_ids_and_collect_deltas", other)),
        };
        for delta in deltas {
            let projected = match changelist::project_columns(&delta.val, col_ids) {
                Ok(projected) => projected,
                Err(e) => {
                    tracing::warn!(key = %delta.key, error = %e, "Failed to project delta");
                    return Err(e);
                }
            };
            if let Some(cell) = projected {
                out.push(DeltaKeyAndUpdate {
                    key: delta.key,
                    cell: arena.allocate(&cell)?,
                });
            }
        }
        Ok(())
    }

    /// True while the cursor has deltas left below the scan's upper bound.
    pub fn has_next(&self) -> bool {
        match self.cursor.peek(self.dms.tree()) {
            Some((key, _)) => match self.spec.as_ref().and_then(|s| s.exclusive_upper_bound_row) {
                Some(upper) => key.row_idx() < upper,
                None => true,
            },
            None => false,
        }
    }

    fn check_batch_len(&self, what: &str, len: usize) -> Result<()> {
        if len < self.prepared_count {
            return Err(Error::InvalidArgument(format!(
                "{} holds {} rows but the prepared batch has {}",
                what, len, self.prepared_count
            )));
        }
        Ok(())
    }
}

fn stage_for_apply(
    projection: &Schema,
    key: DeltaKey,
    val: Bytes,
    updates_by_col: &mut [VecDeque<ColumnUpdate>],
    deletes_and_reinserts: &mut VecDeque<DeleteOrReinsert>,
) -> Result<()> {
    let row_id = key.row_idx();
    let decoder = RowChangeListDecoder::new(&val)?;
    for update in decoder.column_updates() {
        let update = update?;
        let Some(col_idx) = projection.find_column_by_id(update.col_id) else {
            continue;
        };
        let new_value = update.value.map(|v| val.slice_ref(v));
        let queue = &mut updates_by_col[col_idx];
        // deltas arrive in key order, so an earlier value for this cell is last
        match queue.back_mut() {
            Some(last) if last.row_id == row_id => last.new_value = new_value,
            _ => queue.push_back(ColumnUpdate { row_id, new_value }),
        }
    }
    if decoder.is_delete() || decoder.is_reinsert() {
        deletes_and_reinserts.push_back(DeleteOrReinsert {
            row_id,
            exists: decoder.is_reinsert(),
        });
    }
    Ok(())
}

fn not_initialized() -> Error {
    Error::IllegalState("iterator not initialized".to_string())
}

fn wrong_mode(op: &str, prepared: &Prepared) -> Error {
    Error::IllegalState(format!("{} called while {}", op, prepared.name()))
}

impl fmt::Debug for DmsIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmsIterator")
            .field("dms", &self.dms)
            .field("snapshot", &self.snapshot)
            .field("cursor", &self.cursor)
            .field("state", &self.prepared.name())
            .field("prepared_idx", &self.prepared_idx)
            .field("prepared_count", &self.prepared_count)
            .finish()
    }
}

impl fmt::Display for DmsIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DMSIterator(state={}, prepared_idx={}, prepared_count={})",
            self.prepared.name(),
            self.prepared_idx,
            self.prepared_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelist::RowChangeListEncoder;
    use crate::log_anchor::{LogAnchorRegistry, OpId};
    use crate::schema::{ColumnSchema, DataType};
    use std::thread;

    fn ht(v: u64) -> HybridTime {
        HybridTime::new(v)
    }

    fn op() -> OpId {
        OpId::new(1, 1)
    }

    fn int(v: i32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn set(cols: &[(u32, i32)]) -> Vec<u8> {
        let mut enc = RowChangeListEncoder::new();
        for (col, v) in cols {
            enc.add_column_update(ColumnId(*col), Some(&int(*v))).unwrap();
        }
        enc.finish()
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                ColumnSchema::new(ColumnId(1), "a", DataType::Int32, true),
                ColumnSchema::new(ColumnId(2), "b", DataType::Int32, true),
                ColumnSchema::new(ColumnId(3), "c", DataType::Int32, true),
            ])
            .unwrap(),
        )
    }

    fn new_dms() -> DeltaMemStore {
        DeltaMemStore::new(0, 0, LogAnchorRegistry::new())
    }

    fn open(dms: &DeltaMemStore, snapshot: MvccSnapshot) -> DmsIterator {
        let mut iter = dms.new_delta_iterator(schema(), snapshot).unwrap();
        iter.init(ScanSpec::new()).unwrap();
        iter.seek_to_ordinal(0).unwrap();
        iter
    }

    fn all() -> MvccSnapshot {
        MvccSnapshot::including_all_transactions()
    }

    /// Collects every visible mutation of rows [0, nrows) as (row, ts, changelist).
    fn collect_all(dms: &DeltaMemStore, snapshot: MvccSnapshot, nrows: usize) -> Vec<(u32, u64, Vec<u8>)> {
        let mut iter = open(dms, snapshot);
        let arena = Arena::new(1024, 1024);
        let covered = iter.prepare_batch(nrows, PrepareFlag::ForCollect).unwrap();
        let mut dst: Vec<Vec<Mutation>> = vec![Vec::new(); covered];
        iter.collect_mutations(&mut dst, &arena).unwrap();
        dst.into_iter()
            .enumerate()
            .flat_map(|(row, muts)| {
                muts.into_iter()
                    .map(move |m| (row as u32, m.timestamp().value(), m.changelist().to_vec()))
            })
            .collect()
    }

    fn apply_column(iter: &DmsIterator, col_idx: usize, nrows: usize) -> ColumnBlock {
        let mut block = ColumnBlock::new(&schema().columns()[col_idx], nrows);
        iter.apply_updates(col_idx, &mut block).unwrap();
        block
    }

    #[test]
    fn test_collect_yields_updates_in_key_order() {
        let dms = new_dms();
        let writes = [(7u32, 3u64), (2, 1), (7, 1), (0, 9), (2, 5), (7, 2)];
        for (row, ts) in writes {
            dms.update(ht(ts), row, &set(&[(1, (row * 100) as i32 + ts as i32)]), &op())
                .unwrap();
        }

        let collected = collect_all(&dms, all(), 10);
        let order: Vec<_> = collected.iter().map(|(r, t, _)| (*r, *t)).collect();
        assert_eq!(order, vec![(0, 9), (2, 1), (2, 5), (7, 1), (7, 2), (7, 3)]);
        for (row, ts, cl) in collected {
            assert_eq!(cl, set(&[(1, (row * 100) as i32 + ts as i32)]));
        }
    }

    #[test]
    fn test_same_timestamp_updates_keep_insertion_order() {
        let dms = new_dms();
        dms.update(ht(4), 1, &set(&[(1, 10)]), &op()).unwrap();
        dms.update(ht(4), 1, &set(&[(1, 20)]), &op()).unwrap();

        let collected = collect_all(&dms, all(), 2);
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].2, set(&[(1, 10)]));
        assert_eq!(collected[1].2, set(&[(1, 20)]));

        let mut iter = open(&dms, all());
        iter.prepare_batch(2, PrepareFlag::ForApply).unwrap();
        let block = apply_column(&iter, 0, 2);
        assert_eq!(block.cell(1), Some(&int(20)[..]));
    }

    #[test]
    fn test_apply_last_write_wins() {
        let dms = new_dms();
        dms.update(ht(1), 3, &set(&[(1, 1), (2, 100)]), &op()).unwrap();
        dms.update(ht(2), 3, &set(&[(1, 2)]), &op()).unwrap();
        dms.update(ht(3), 3, &set(&[(1, 3)]), &op()).unwrap();
        dms.update(ht(1), 4, &set(&[(3, 44)]), &op()).unwrap();

        let mut iter = open(&dms, all());
        assert_eq!(iter.prepare_batch(5, PrepareFlag::ForApply).unwrap(), 5);

        let a = apply_column(&iter, 0, 5);
        assert_eq!(a.cell(3), Some(&int(3)[..]));
        assert!(a.is_null(4));

        let b = apply_column(&iter, 1, 5);
        assert_eq!(b.cell(3), Some(&int(100)[..]));

        let c = apply_column(&iter, 2, 5);
        assert_eq!(c.cell(4), Some(&int(44)[..]));
        assert!(c.is_null(3));
    }

    #[test]
    fn test_delete_then_reinsert() {
        let dms = new_dms();
        dms.update(ht(1), 2, &set(&[(1, 11)]), &op()).unwrap();
        dms.update(ht(2), 2, &RowChangeListEncoder::delete(), &op()).unwrap();
        dms.update(ht(3), 2, &RowChangeListEncoder::reinsert().finish(), &op())
            .unwrap();
        dms.update(ht(2), 1, &RowChangeListEncoder::delete(), &op()).unwrap();

        let mut iter = open(&dms, all());
        iter.prepare_batch(4, PrepareFlag::ForApply).unwrap();
        let mut sel = SelectionVector::all_selected(4);
        iter.apply_deletes(&mut sel).unwrap();
        assert!(sel.is_row_selected(0));
        assert!(!sel.is_row_selected(1));
        assert!(sel.is_row_selected(2));
        assert!(sel.is_row_selected(3));

        let a = apply_column(&iter, 0, 4);
        assert_eq!(a.cell(2), Some(&int(11)[..]));

        // without the reinsert the row stays deleted
        let mut iter = open(&dms, MvccSnapshot::committed_before(ht(3)));
        iter.prepare_batch(4, PrepareFlag::ForApply).unwrap();
        let mut sel = SelectionVector::all_selected(4);
        iter.apply_deletes(&mut sel).unwrap();
        assert!(!sel.is_row_selected(2));
    }

    #[test]
    fn test_reinsert_values_are_applied() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(2, 1)]), &op()).unwrap();
        dms.update(ht(2), 0, &RowChangeListEncoder::delete(), &op()).unwrap();
        let mut reinsert = RowChangeListEncoder::reinsert();
        reinsert.add_column_update(ColumnId(2), Some(&int(9))).unwrap();
        dms.update(ht(3), 0, &reinsert.finish(), &op()).unwrap();

        let mut iter = open(&dms, all());
        iter.prepare_batch(1, PrepareFlag::ForApply).unwrap();
        let b = apply_column(&iter, 1, 1);
        assert_eq!(b.cell(0), Some(&int(9)[..]));
    }

    #[test]
    fn test_snapshot_hides_newer_deltas() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(1, 1)]), &op()).unwrap();
        dms.update(ht(5), 0, &set(&[(1, 5)]), &op()).unwrap();
        dms.update(ht(6), 1, &RowChangeListEncoder::delete(), &op()).unwrap();

        let snap = MvccSnapshot::committed_before(ht(5));
        let mut iter = open(&dms, snap.clone());
        iter.prepare_batch(2, PrepareFlag::ForApply).unwrap();
        let a = apply_column(&iter, 0, 2);
        assert_eq!(a.cell(0), Some(&int(1)[..]));
        let mut sel = SelectionVector::all_selected(2);
        iter.apply_deletes(&mut sel).unwrap();
        assert!(sel.is_row_selected(1));

        let collected = collect_all(&dms, snap, 2);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].1, 1);

        // aborted transactions are skipped as well
        let aborted = all().with_aborted([ht(5)]);
        let collected = collect_all(&dms, aborted, 2);
        let timestamps: Vec<_> = collected.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(timestamps, vec![1, 6]);
    }

    #[test]
    fn test_collect_round_trip() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(1, 1), (2, 2)]), &op()).unwrap();
        dms.update(ht(3), 0, &RowChangeListEncoder::delete(), &op()).unwrap();
        dms.update(ht(2), 5, &set(&[(3, 7)]), &op()).unwrap();
        dms.update(ht(2), 5, &set(&[(3, 8)]), &op()).unwrap();
        dms.update(ht(9), 8, &RowChangeListEncoder::reinsert().finish(), &op())
            .unwrap();

        let original = collect_all(&dms, all(), 10);

        let copy = new_dms();
        for (row, ts, cl) in &original {
            copy.update(ht(*ts), *row, cl, &op()).unwrap();
        }
        assert_eq!(collect_all(&copy, all(), 10), original);
    }

    #[test]
    fn test_filter_column_ids_and_collect() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(1, 1), (2, 2), (3, 3)]), &op()).unwrap();
        dms.update(ht(1), 1, &set(&[(1, 4), (3, 6)]), &op()).unwrap();
        dms.update(ht(2), 1, &RowChangeListEncoder::delete(), &op()).unwrap();

        let mut iter = open(&dms, all());
        iter.prepare_batch(2, PrepareFlag::ForCollect).unwrap();
        let arena = Arena::new(256, 256);
        let mut out = Vec::new();
        iter.filter_column_ids_and_collect_deltas(&[ColumnId(2)], &mut out, &arena)
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, DeltaKey::new(0, ht(1)));
        assert_eq!(&out[0].cell[..], &set(&[(2, 2)])[..]);
        assert_eq!(out[1].key, DeltaKey::new(1, ht(2)));
        assert_eq!(&out[1].cell[..], &RowChangeListEncoder::delete()[..]);
        assert!(out[1].to_string().contains("DELETE"));
    }

    #[test]
    fn test_batches_advance_through_rows() {
        let dms = new_dms();
        for row in 0..10u32 {
            dms.update(ht(1), row, &set(&[(1, row as i32)]), &op()).unwrap();
        }

        let mut iter = open(&dms, all());
        let mut seen = Vec::new();
        for batch in 0..4 {
            assert!(iter.has_next());
            let n = iter.prepare_batch(3, PrepareFlag::ForApply).unwrap();
            assert_eq!(n, 3);
            let a = apply_column(&iter, 0, n);
            for i in 0..n {
                let row = batch * 3 + i;
                if row < 10 {
                    seen.push(a.cell(i).map(|c| c.to_vec()));
                }
            }
        }
        assert!(!iter.has_next());
        let expected: Vec<_> = (0..10).map(|v: i32| Some(int(v).to_vec())).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_seek_and_scan_bounds() {
        let dms = new_dms();
        for row in [1u32, 4, 6, 9] {
            dms.update(ht(1), row, &set(&[(1, row as i32)]), &op()).unwrap();
        }

        let mut iter = dms.new_delta_iterator(schema(), all()).unwrap();
        iter.init(ScanSpec::new().lower_bound_row(3).exclusive_upper_bound_row(7))
            .unwrap();
        iter.seek_to_ordinal(0).unwrap();
        assert_eq!(iter.prepare_batch(100, PrepareFlag::ForCollect).unwrap(), 4);

        let arena = Arena::new(64, 64);
        let mut dst: Vec<Vec<Mutation>> = vec![Vec::new(); 4];
        iter.collect_mutations(&mut dst, &arena).unwrap();
        let counts: Vec<_> = dst.iter().map(|m| m.len()).collect();
        assert_eq!(counts, vec![0, 1, 0, 1]);
        assert!(!iter.has_next());

        // re-seeking resets the prepared batch
        iter.seek_to_ordinal(6).unwrap();
        assert!(iter.collect_mutations(&mut dst, &arena).is_err());
        assert!(iter.has_next());
        assert_eq!(iter.prepare_batch(10, PrepareFlag::ForCollect).unwrap(), 1);
    }

    #[test]
    fn test_state_machine_errors() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(1, 1)]), &op()).unwrap();
        let arena = Arena::new(64, 64);

        let mut iter = dms.new_delta_iterator(schema(), all()).unwrap();
        assert!(matches!(iter.seek_to_ordinal(0), Err(Error::IllegalState(_))));
        assert!(matches!(
            iter.prepare_batch(1, PrepareFlag::ForApply),
            Err(Error::IllegalState(_))
        ));

        iter.init(ScanSpec::new()).unwrap();
        assert!(matches!(iter.init(ScanSpec::new()), Err(Error::IllegalState(_))));
        assert!(matches!(
            iter.prepare_batch(1, PrepareFlag::ForApply),
            Err(Error::IllegalState(_))
        ));

        iter.seek_to_ordinal(0).unwrap();
        let mut sel = SelectionVector::all_selected(1);
        assert!(matches!(iter.apply_deletes(&mut sel), Err(Error::IllegalState(_))));

        iter.prepare_batch(1, PrepareFlag::ForApply).unwrap();
        let mut dst: Vec<Vec<Mutation>> = vec![Vec::new(); 1];
        assert!(matches!(
            iter.collect_mutations(&mut dst, &arena),
            Err(Error::IllegalState(_))
        ));
        let mut out = Vec::new();
        assert!(matches!(
            iter.filter_column_ids_and_collect_deltas(&[ColumnId(1)], &mut out, &arena),
            Err(Error::IllegalState(_))
        ));
        assert!(matches!(
            iter.apply_updates(3, &mut ColumnBlock::new(&schema().columns()[0], 1)),
            Err(Error::InvalidArgument(_))
        ));

        iter.seek_to_ordinal(0).unwrap();
        iter.prepare_batch(1, PrepareFlag::ForCollect).unwrap();
        assert!(matches!(
            iter.apply_updates(0, &mut ColumnBlock::new(&schema().columns()[0], 1)),
            Err(Error::IllegalState(_))
        ));
        let mut too_small: Vec<Vec<Mutation>> = Vec::new();
        assert!(matches!(
            iter.collect_mutations(&mut too_small, &arena),
            Err(Error::InvalidArgument(_))
        ));
        assert!(iter.to_string().contains("PREPARED_FOR_COLLECT"));
    }

    #[test]
    fn test_corrupt_delta_does_not_lose_batch() {
        let dms = new_dms();
        dms.update(ht(1), 0, &set(&[(1, 7)]), &op()).unwrap();
        dms.update(ht(1), 2, &set(&[(1, 9)]), &op()).unwrap();
        // truncated update: tag, then half a column id
        dms.tree()
            .insert(DeltaKey::new(1, ht(1)), Bytes::from_static(&[1, 0, 0]))
            .unwrap();

        let mut iter = open(&dms, all());
        for _ in 0..2 {
            let err = iter.prepare_batch(3, PrepareFlag::ForApply).unwrap_err();
            assert!(err.is_corruption());
        }

        // row by row, the caller can keep row 0 and skip the bad row
        assert_eq!(iter.prepare_batch(1, PrepareFlag::ForApply).unwrap(), 1);
        let a = apply_column(&iter, 0, 1);
        assert_eq!(a.cell(0), Some(&int(7)[..]));
        assert!(iter.prepare_batch(1, PrepareFlag::ForApply).unwrap_err().is_corruption());

        iter.seek_to_ordinal(2).unwrap();
        assert_eq!(iter.prepare_batch(1, PrepareFlag::ForApply).unwrap(), 1);
        let a = apply_column(&iter, 0, 1);
        assert_eq!(a.cell(0), Some(&int(9)[..]));
        assert!(format!("{:?}", iter).contains("PREPARED_FOR_APPLY"));
    }

    #[test]
    fn test_readers_concurrent_with_writer() {
        let dms = new_dms();
        let visible_until = 500u64;
        let writer = {
            let dms = dms.clone();
            thread::spawn(move || {
                for i in 0..1000u64 {
                    let row = ((i * 31) % 200) as u32;
                    dms.update(ht(i + 1), row, &set(&[(1, i as i32)]), &op())
                        .unwrap();
                }
            })
        };

        // the first delta must exist before a reader can open an iterator
        while dms.is_empty() {
            thread::yield_now();
        }

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let dms = dms.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let snap = MvccSnapshot::committed_before(ht(visible_until + 1));
                        for (_, ts, _) in collect_all(&dms, snap, 200) {
                            assert!(ts <= visible_until);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        let collected = collect_all(&dms, MvccSnapshot::committed_before(ht(visible_until + 1)), 200);
        assert_eq!(collected.len(), visible_until as usize);
    }
}
