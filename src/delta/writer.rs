use super::key::DeltaKey;
use super::stats::DeltaStats;
use crate::encoding::Key;
use crate::error::{Error, Result};

/// Sink for a flushed delta store. Entries arrive strictly in key order,
/// followed by a single `write_delta_stats` call.
pub trait DeltaFileWriter {
    fn append_delta(&mut self, key: &DeltaKey, changelist: &[u8]) -> Result<()>;

    fn write_delta_stats(&mut self, stats: &DeltaStats) -> Result<()>;
}

/// Writer that keeps encoded entries in memory. Useful for handing a flushed
/// store to a compaction in the same process.
#[derive(Debug, Default)]
pub struct BufferedDeltaWriter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    stats: Option<Vec<u8>>,
}

impl BufferedDeltaWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded (key, change list) pairs in the order written.
    pub fn raw_entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    /// Decoded entries in the order written.
    pub fn entries(&self) -> Result<Vec<(DeltaKey, Vec<u8>)>> {
        self.entries
            .iter()
            .map(|(k, v)| Ok((DeltaKey::decode(k)?, v.clone())))
            .collect()
    }

    pub fn stats(&self) -> Result<Option<DeltaStats>> {
        self.stats.as_deref().map(DeltaStats::decode).transpose()
    }
}

impl DeltaFileWriter for BufferedDeltaWriter {
    fn append_delta(&mut self, key: &DeltaKey, changelist: &[u8]) -> Result<()> {
        if self.stats.is_some() {
            return Err(Error::IllegalState(
                "delta appended after stats were written".to_string(),
            ));
        }
        let encoded = key.encode();
        if let Some((last, _)) = self.entries.last() {
            if *last >= encoded {
                return Err(Error::InvalidArgument(format!(
                    "delta {} is not after the previous entry",
                    key
                )));
            }
        }
        self.entries.push((encoded, changelist.to_vec()));
        Ok(())
    }

    fn write_delta_stats(&mut self, stats: &DeltaStats) -> Result<()> {
        if self.stats.is_some() {
            return Err(Error::IllegalState("delta stats already written".to_string()));
        }
        self.stats = Some(stats.encode()?);
        Ok(())
    }
}
