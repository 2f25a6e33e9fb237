use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable identifier of a column, independent of its position in a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnId(pub u32);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
    Binary,
}

impl DataType {
    /// Encoded width of a cell, or `None` for variable-length types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Int8 => Some(1),
            DataType::Int16 => Some(2),
            DataType::Int32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::Double => Some(8),
            DataType::String | DataType::Binary => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    id: ColumnId,
    name: String,
    data_type: DataType,
    nullable: bool,
}

impl ColumnSchema {
    pub fn new(id: ColumnId, name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// Ordered list of columns. Used both as a table schema and as a read
/// projection; the delta store only ever reads it.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    index_by_id: HashMap<ColumnId, usize>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSchema>) -> Result<Self> {
        let mut index_by_id = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            if index_by_id.insert(col.id, idx).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "duplicate column id {} in schema",
                    col.id
                )));
            }
        }
        Ok(Self {
            columns,
            index_by_id,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    /// Position of the column with the given id within this schema.
    pub fn find_column_by_id(&self, id: ColumnId) -> Option<usize> {
        self.index_by_id.get(&id).copied()
    }

    pub fn column_ids(&self) -> Vec<ColumnId> {
        self.columns.iter().map(|c| c.id).collect()
    }
}
