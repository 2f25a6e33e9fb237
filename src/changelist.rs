//! Encoded row change lists.
//!
//! A change list describes one mutation to one row. Layout:
//!
//! ```text
//! +---------+-----------------------------------------------+
//! | type u8 | entries (Update and Reinsert only)            |
//! +---------+-----------------------------------------------+
//!
//! entry: column_id u32 | null u8 | [len u32 | value bytes]   (big-endian)
//! ```
//!
//! Delete carries no entries. Reinsert carries the column values of the
//! re-inserted row, which may be empty.

use crate::error::{Error, Result};
use crate::schema::ColumnId;
use byteorder::{BigEndian, ByteOrder};
use itertools::Itertools;
use std::fmt;

const TAG_UPDATE: u8 = 1;
const TAG_DELETE: u8 = 2;
const TAG_REINSERT: u8 = 3;

const NULL_FLAG: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Update,
    Delete,
    Reinsert,
}

impl ChangeType {
    fn tag(self) -> u8 {
        match self {
            ChangeType::Update => TAG_UPDATE,
            ChangeType::Delete => TAG_DELETE,
            ChangeType::Reinsert => TAG_REINSERT,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TAG_UPDATE => Ok(ChangeType::Update),
            TAG_DELETE => Ok(ChangeType::Delete),
            TAG_REINSERT => Ok(ChangeType::Reinsert),
            other => Err(Error::Corruption(format!(
                "unknown change list type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Update => write!(f, "SET"),
            ChangeType::Delete => write!(f, "DELETE"),
            ChangeType::Reinsert => write!(f, "REINSERT"),
        }
    }
}

/// One column assignment inside an Update or Reinsert. `None` is SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnUpdate<'a> {
    pub col_id: ColumnId,
    pub value: Option<&'a [u8]>,
}

/// Builds an encoded change list.
pub struct RowChangeListEncoder {
    buffer: Vec<u8>,
    change_type: Option<ChangeType>,
}

impl Default for RowChangeListEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RowChangeListEncoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            change_type: None,
        }
    }

    /// An encoded Delete.
    pub fn delete() -> Vec<u8> {
        vec![TAG_DELETE]
    }

    /// Starts a Reinsert; column values may follow.
    pub fn reinsert() -> Self {
        Self {
            buffer: vec![TAG_REINSERT],
            change_type: Some(ChangeType::Reinsert),
        }
    }

    /// Appends a column assignment, turning an uninitialized encoder into an
    /// Update.
    pub fn add_column_update(&mut self, col_id: ColumnId, value: Option<&[u8]>) -> Result<()> {
        match self.change_type {
            None => {
                self.buffer.push(TAG_UPDATE);
                self.change_type = Some(ChangeType::Update);
            }
            Some(ChangeType::Delete) => {
                return Err(Error::InvalidArgument(
                    "cannot add column updates to a delete".to_string(),
                ))
            }
            Some(_) => {}
        }
        put_u32(&mut self.buffer, col_id.0);
        match value {
            Some(v) => {
                let len = u32::try_from(v.len()).map_err(|_| {
                    Error::InvalidArgument(format!("cell value of {} bytes too large", v.len()))
                })?;
                self.buffer.push(0);
                put_u32(&mut self.buffer, len);
                self.buffer.extend_from_slice(v);
            }
            None => self.buffer.push(NULL_FLAG),
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.change_type.is_some()
    }

    pub fn change_type(&self) -> Option<ChangeType> {
        self.change_type
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

/// Zero-copy reader over an encoded change list.
#[derive(Debug, Clone, Copy)]
pub struct RowChangeListDecoder<'a> {
    data: &'a [u8],
    change_type: ChangeType,
}

impl<'a> RowChangeListDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let tag = *data
            .first()
            .ok_or_else(|| Error::Corruption("empty change list".to_string()))?;
        let change_type = ChangeType::from_tag(tag)?;
        if change_type == ChangeType::Delete && data.len() != 1 {
            return Err(Error::Corruption(format!(
                "delete change list has {} trailing bytes",
                data.len() - 1
            )));
        }
        Ok(Self { data, change_type })
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn is_update(&self) -> bool {
        self.change_type == ChangeType::Update
    }

    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }

    pub fn is_reinsert(&self) -> bool {
        self.change_type == ChangeType::Reinsert
    }

    /// Column assignments carried by an Update or Reinsert; empty for Delete.
    pub fn column_updates(&self) -> ColumnUpdates<'a> {
        ColumnUpdates {
            data: self.data,
            pos: 1,
            failed: false,
        }
    }

    /// Walks every entry, failing on the first malformed one.
    pub fn validate(&self) -> Result<()> {
        for update in self.column_updates() {
            update?;
        }
        Ok(())
    }
}

pub struct ColumnUpdates<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> ColumnUpdates<'a> {
    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let end = self.pos + 4;
        if end > self.data.len() {
            return Err(Error::Corruption(format!(
                "change list truncated reading {} at offset {}",
                what, self.pos
            )));
        }
        let v = BigEndian::read_u32(&self.data[self.pos..end]);
        self.pos = end;
        Ok(v)
    }

    fn decode_next(&mut self) -> Result<ColumnUpdate<'a>> {
        let col_id = ColumnId(self.read_u32("column id")?);
        let flag = *self.data.get(self.pos).ok_or_else(|| {
            Error::Corruption(format!("change list truncated after column {}", col_id))
        })?;
        self.pos += 1;
        match flag {
            NULL_FLAG => Ok(ColumnUpdate {
                col_id,
                value: None,
            }),
            0 => {
                let len = self.read_u32("value length")? as usize;
                let end = self.pos + len;
                if end > self.data.len() {
                    return Err(Error::Corruption(format!(
                        "value for column {} overruns change list",
                        col_id
                    )));
                }
                let value = &self.data[self.pos..end];
                self.pos = end;
                Ok(ColumnUpdate {
                    col_id,
                    value: Some(value),
                })
            }
            other => Err(Error::Corruption(format!(
                "invalid null flag {} for column {}",
                other, col_id
            ))),
        }
    }
}

impl<'a> Iterator for ColumnUpdates<'a> {
    type Item = Result<ColumnUpdate<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let result = self.decode_next();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Re-encodes `data` keeping only the assignments to `col_ids`. Returns
/// `None` for an Update left with no assignments. Deletes pass through
/// unchanged; Reinserts keep their marker.
pub fn project_columns(data: &[u8], col_ids: &[ColumnId]) -> Result<Option<Vec<u8>>> {
    let decoder = RowChangeListDecoder::new(data)?;
    let mut encoder = match decoder.change_type() {
        ChangeType::Delete => return Ok(Some(data.to_vec())),
        ChangeType::Reinsert => RowChangeListEncoder::reinsert(),
        ChangeType::Update => RowChangeListEncoder::new(),
    };
    for update in decoder.column_updates() {
        let update = update?;
        if col_ids.contains(&update.col_id) {
            encoder.add_column_update(update.col_id, update.value)?;
        }
    }
    if encoder.is_initialized() {
        Ok(Some(encoder.finish()))
    } else {
        Ok(None)
    }
}

/// Human-readable rendering, e.g. `SET 1=0x0a, 2=NULL`.
pub fn debug_string(data: &[u8]) -> String {
    let decoder = match RowChangeListDecoder::new(data) {
        Ok(d) => d,
        Err(e) => return format!("[invalid: {}]", e),
    };
    let updates: Result<Vec<ColumnUpdate<'_>>> = decoder.column_updates().collect();
    match updates {
        Ok(updates) if updates.is_empty() => decoder.change_type().to_string(),
        Ok(updates) => format!(
            "{} {}",
            decoder.change_type(),
            updates.iter().map(format_update).join(", ")
        ),
        Err(e) => format!("[invalid: {}]", e),
    }
}

fn format_update(update: &ColumnUpdate<'_>) -> String {
    match update.value {
        Some(v) => format!(
            "{}=0x{}",
            update.col_id,
            v.iter().map(|b| format!("{:02x}", b)).join("")
        ),
        None => format!("{}=NULL", update.col_id),
    }
}
