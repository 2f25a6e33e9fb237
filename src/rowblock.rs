//! Caller-owned buffers that deltas are applied onto.

use crate::error::{Error, Result};
use crate::schema::{ColumnSchema, DataType};

/// One column's cells for a contiguous run of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBlock {
    data_type: DataType,
    nullable: bool,
    cells: Vec<Option<Vec<u8>>>,
}

impl ColumnBlock {
    /// A block of `nrows` cells, initialised to NULL.
    pub fn new(column: &ColumnSchema, nrows: usize) -> Self {
        Self {
            data_type: column.data_type(),
            nullable: column.is_nullable(),
            cells: vec![None; nrows],
        }
    }

    pub fn nrows(&self) -> usize {
        self.cells.len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn cell(&self, idx: usize) -> Option<&[u8]> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.cell(idx).is_none()
    }

    /// Overwrites one cell, checking the value against the column type.
    pub fn set_cell_value(&mut self, idx: usize, value: Option<&[u8]>) -> Result<()> {
        let nrows = self.cells.len();
        let slot = self.cells.get_mut(idx).ok_or_else(|| {
            Error::InvalidArgument(format!("row {} out of range for block of {} rows", idx, nrows))
        })?;
        match value {
            None if !self.nullable => {
                return Err(Error::Corruption(
                    "NULL value for non-nullable column".to_string(),
                ))
            }
            Some(v) => {
                if let Some(width) = self.data_type.fixed_size() {
                    if v.len() != width {
                        return Err(Error::Corruption(format!(
                            "{:?} cell must be {} bytes, got {}",
                            self.data_type,
                            width,
                            v.len()
                        )));
                    }
                }
            }
            None => {}
        }
        *slot = value.map(|v| v.to_vec());
        Ok(())
    }
}

/// One bit per row; a cleared bit means the row is filtered out or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionVector {
    nrows: usize,
    bitmap: Vec<u8>,
}

impl SelectionVector {
    /// All rows unselected.
    pub fn new(nrows: usize) -> Self {
        Self {
            nrows,
            bitmap: vec![0; nrows.div_ceil(8)],
        }
    }

    /// All rows selected.
    pub fn all_selected(nrows: usize) -> Self {
        let mut sel = Self::new(nrows);
        for row in 0..nrows {
            sel.set_row_selected(row);
        }
        sel
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn is_row_selected(&self, row: usize) -> bool {
        row < self.nrows && self.bitmap[row / 8] & (1 << (row % 8)) != 0
    }

    pub fn set_row_selected(&mut self, row: usize) {
        debug_assert!(row < self.nrows);
        self.bitmap[row / 8] |= 1 << (row % 8);
    }

    pub fn set_row_unselected(&mut self, row: usize) {
        debug_assert!(row < self.nrows);
        self.bitmap[row / 8] &= !(1 << (row % 8));
    }

    pub fn count_selected(&self) -> usize {
        (0..self.nrows).filter(|r| self.is_row_selected(*r)).count()
    }

    pub fn any_selected(&self) -> bool {
        self.bitmap.iter().any(|b| *b != 0)
    }
}
