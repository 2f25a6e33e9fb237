use crate::encoding::{EncodingError, Key};
use crate::error::Result;
use crate::hybrid_time::HybridTime;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Ordinal of a row within its rowset.
pub type RowId = u32;

const ENCODED_LEN: usize = 16;

/// Index key of a delta: row first, then time, then the tie-breaker for
/// same-row mutations sharing a timestamp. The derived `Ord` follows field
/// order, so every delta of a row is contiguous and chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeltaKey {
    row_idx: RowId,
    timestamp: HybridTime,
    disambiguator: u32,
}

impl DeltaKey {
    pub fn new(row_idx: RowId, timestamp: HybridTime) -> Self {
        Self::with_disambiguator(row_idx, timestamp, 0)
    }

    pub fn with_disambiguator(row_idx: RowId, timestamp: HybridTime, disambiguator: u32) -> Self {
        Self {
            row_idx,
            timestamp,
            disambiguator,
        }
    }

    /// Smallest key of `row_idx`; seeking here lands on the row's first delta.
    pub fn min_for_row(row_idx: RowId) -> Self {
        Self::with_disambiguator(row_idx, HybridTime::MIN, 0)
    }

    pub fn row_idx(&self) -> RowId {
        self.row_idx
    }

    pub fn timestamp(&self) -> HybridTime {
        self.timestamp
    }

    pub fn disambiguator(&self) -> u32 {
        self.disambiguator
    }
}

impl Key for DeltaKey {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENCODED_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.row_idx);
        BigEndian::write_u64(&mut buf[4..12], self.timestamp.value());
        BigEndian::write_u32(&mut buf[12..16], self.disambiguator);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_LEN {
            return Err(EncodingError::TruncatedData.into());
        }
        if bytes.len() > ENCODED_LEN {
            return Err(EncodingError::InvalidFormat(format!(
                "delta key must be {} bytes, got {}",
                ENCODED_LEN,
                bytes.len()
            ))
            .into());
        }
        Ok(Self {
            row_idx: BigEndian::read_u32(&bytes[0..4]),
            timestamp: HybridTime::new(BigEndian::read_u64(&bytes[4..12])),
            disambiguator: BigEndian::read_u32(&bytes[12..16]),
        })
    }
}

impl fmt::Display for DeltaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(row {}@ts{}", self.row_idx, self.timestamp.value())?;
        if self.disambiguator != 0 {
            write!(f, "#{}", self.disambiguator)?;
        }
        write!(f, ")")
    }
}
