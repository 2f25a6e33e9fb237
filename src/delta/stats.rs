use super::key::{DeltaKey, RowId};
use crate::changelist::{ChangeType, RowChangeListDecoder};
use crate::encoding::bincode;
use crate::error::Result;
use crate::hybrid_time::HybridTime;
use crate::schema::ColumnId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Aggregate statistics over a sequence of deltas, gathered while flushing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    rows_touched: u64,
    delete_count: u64,
    reinsert_count: u64,
    update_counts: BTreeMap<ColumnId, u64>,
    min_timestamp: Option<HybridTime>,
    max_timestamp: Option<HybridTime>,
}

impl DeltaStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one delta. A corrupt change list leaves the stats untouched.
    fn record(&mut self, key: &DeltaKey, changelist: &[u8], new_row: bool) -> Result<()> {
        let decoder = RowChangeListDecoder::new(changelist)?;
        let mut columns = Vec::new();
        match decoder.change_type() {
            ChangeType::Delete => {}
            ChangeType::Reinsert => decoder.validate()?,
            ChangeType::Update => {
                for update in decoder.column_updates() {
                    columns.push(update?.col_id);
                }
            }
        }

        match decoder.change_type() {
            ChangeType::Delete => self.delete_count += 1,
            ChangeType::Reinsert => self.reinsert_count += 1,
            ChangeType::Update => {
                for col_id in columns {
                    *self.update_counts.entry(col_id).or_insert(0) += 1;
                }
            }
        }
        if new_row {
            self.rows_touched += 1;
        }
        let ts = key.timestamp();
        self.min_timestamp = Some(self.min_timestamp.map_or(ts, |min| min.min(ts)));
        self.max_timestamp = Some(self.max_timestamp.map_or(ts, |max| max.max(ts)));
        Ok(())
    }

    pub fn rows_touched(&self) -> u64 {
        self.rows_touched
    }

    pub fn delete_count(&self) -> u64 {
        self.delete_count
    }

    pub fn reinsert_count(&self) -> u64 {
        self.reinsert_count
    }

    pub fn update_count(&self, col_id: ColumnId) -> u64 {
        self.update_counts.get(&col_id).copied().unwrap_or(0)
    }

    pub fn total_update_count(&self) -> u64 {
        self.update_counts.values().sum()
    }

    pub fn min_timestamp(&self) -> Option<HybridTime> {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Option<HybridTime> {
        self.max_timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.rows_touched == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Display for DeltaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows={} updates={} deletes={} reinserts={}",
            self.rows_touched,
            self.total_update_count(),
            self.delete_count,
            self.reinsert_count
        )?;
        if let (Some(min), Some(max)) = (self.min_timestamp, self.max_timestamp) {
            write!(f, " ts=[{}, {}]", min.value(), max.value())?;
        }
        Ok(())
    }
}

/// Builds `DeltaStats` from deltas fed in key order.
#[derive(Debug, Default)]
pub struct DeltaStatsCollector {
    stats: DeltaStats,
    last_row: Option<RowId>,
}

impl DeltaStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_stats(&mut self, key: &DeltaKey, changelist: &[u8]) -> Result<()> {
        let new_row = self.last_row != Some(key.row_idx());
        self.stats.record(key, changelist, new_row)?;
        self.last_row = Some(key.row_idx());
        Ok(())
    }

    pub fn stats(&self) -> &DeltaStats {
        &self.stats
    }

    pub fn finish(self) -> DeltaStats {
        self.stats
    }
}
