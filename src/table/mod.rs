//! Columnar tables.
//!
//! The writer side of the pipeline works on columns, not records. A
//! [`Table`] is one block's worth of data laid out as an ordered list of
//! [`ColumnBatch`]es, all of the same length. Its [`Schema`] is the ordered
//! list of `(name, type)` fields; every process derives the same schema so
//! that output datasets are created identically everywhere.
//!
//! [`TouchTableBuilder`] is the table-construction step for touch records.


use thiserror::Error;

use crate::record::{IndexedTouch, LayoutVersion};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while building tables.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// A projected column does not exist for the layout.
    #[error("unknown column '{name}' for layout {version}")]
    UnknownColumn { name: String, version: LayoutVersion },

    /// The projection selects nothing.
    #[error("column projection is empty")]
    EmptyProjection,
}

// ------------------------------------------------------------------------------------------------
// Types
// ------------------------------------------------------------------------------------------------

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Boolean,
    Utf8,
}

/// Owned values of one column batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Boolean(Vec<bool>),
    Utf8(Vec<String>),
}

macro_rules! dispatch {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($v) => $body,
            ColumnData::UInt8($v) => $body,
            ColumnData::Int16($v) => $body,
            ColumnData::UInt16($v) => $body,
            ColumnData::Int32($v) => $body,
            ColumnData::UInt32($v) => $body,
            ColumnData::Int64($v) => $body,
            ColumnData::UInt64($v) => $body,
            ColumnData::Float32($v) => $body,
            ColumnData::Float64($v) => $body,
            ColumnData::Boolean($v) => $body,
            ColumnData::Utf8($v) => $body,
        }
    };
}

impl ColumnData {
    /// Number of values.
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical type of the values.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Int8(_) => ColumnType::Int8,
            Self::UInt8(_) => ColumnType::UInt8,
            Self::Int16(_) => ColumnType::Int16,
            Self::UInt16(_) => ColumnType::UInt16,
            Self::Int32(_) => ColumnType::Int32,
            Self::UInt32(_) => ColumnType::UInt32,
            Self::Int64(_) => ColumnType::Int64,
            Self::UInt64(_) => ColumnType::UInt64,
            Self::Float32(_) => ColumnType::Float32,
            Self::Float64(_) => ColumnType::Float64,
            Self::Boolean(_) => ColumnType::Boolean,
            Self::Utf8(_) => ColumnType::Utf8,
        }
    }

    /// Empty data of the given type with room for `capacity` values.
    pub fn with_capacity(ty: ColumnType, capacity: usize) -> Self {
        match ty {
            ColumnType::Int8 => Self::Int8(Vec::with_capacity(capacity)),
            ColumnType::UInt8 => Self::UInt8(Vec::with_capacity(capacity)),
            ColumnType::Int16 => Self::Int16(Vec::with_capacity(capacity)),
            ColumnType::UInt16 => Self::UInt16(Vec::with_capacity(capacity)),
            ColumnType::Int32 => Self::Int32(Vec::with_capacity(capacity)),
            ColumnType::UInt32 => Self::UInt32(Vec::with_capacity(capacity)),
            ColumnType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            ColumnType::UInt64 => Self::UInt64(Vec::with_capacity(capacity)),
            ColumnType::Float32 => Self::Float32(Vec::with_capacity(capacity)),
            ColumnType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            ColumnType::Boolean => Self::Boolean(Vec::with_capacity(capacity)),
            ColumnType::Utf8 => Self::Utf8(Vec::with_capacity(capacity)),
        }
    }
}

/// One named, typed column of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub column_type: ColumnType,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered list of fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One block of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBatch {
    pub name: String,
    pub data: ColumnData,
}

/// One block of a table: equally long batches in schema order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<ColumnBatch>,
}

impl Table {
    /// Number of rows (0 for a table without columns).
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    /// Schema implied by the batches.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(c.name.clone(), c.data.column_type()))
                .collect(),
        )
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.data)
    }
}

// ------------------------------------------------------------------------------------------------
// Touch table construction
// ------------------------------------------------------------------------------------------------

/// How a column's values are pulled out of a record.
#[derive(Clone, Copy)]
enum Extract {
    I32(fn(&IndexedTouch) -> i32),
    F32(fn(&IndexedTouch) -> f32),
    U8(fn(&IndexedTouch) -> u8),
    I64(fn(&IndexedTouch) -> i64),
}

impl Extract {
    fn column_type(self) -> ColumnType {
        match self {
            Self::I32(_) => ColumnType::Int32,
            Self::F32(_) => ColumnType::Float32,
            Self::U8(_) => ColumnType::UInt8,
            Self::I64(_) => ColumnType::Int64,
        }
    }

    fn collect(self, block: &[IndexedTouch]) -> ColumnData {
        match self {
            Self::I32(f) => ColumnData::Int32(block.iter().map(f).collect()),
            Self::F32(f) => ColumnData::Float32(block.iter().map(f).collect()),
            Self::U8(f) => ColumnData::UInt8(block.iter().map(f).collect()),
            Self::I64(f) => ColumnData::Int64(block.iter().map(f).collect()),
        }
    }
}

struct TouchColumn {
    name: &'static str,
    since: LayoutVersion,
    extract: Extract,
}

const fn col(name: &'static str, since: LayoutVersion, extract: Extract) -> TouchColumn {
    TouchColumn {
        name,
        since,
        extract,
    }
}

use LayoutVersion::{V1, V2, V3};

static TOUCH_COLUMNS: &[TouchColumn] = &[
    col("source_node_id", V1, Extract::I32(|t| t.pre_ids[0])),
    col("source_section_id", V1, Extract::I32(|t| t.pre_ids[1])),
    col("source_segment_id", V1, Extract::I32(|t| t.pre_ids[2])),
    col("target_node_id", V1, Extract::I32(|t| t.post_ids[0])),
    col("target_section_id", V1, Extract::I32(|t| t.post_ids[1])),
    col("target_segment_id", V1, Extract::I32(|t| t.post_ids[2])),
    col("branch", V1, Extract::I32(|t| t.branch)),
    col("distance_soma", V1, Extract::F32(|t| t.distance_soma)),
    col("source_segment_offset", V1, Extract::F32(|t| t.pre_offset)),
    col("target_segment_offset", V1, Extract::F32(|t| t.post_offset)),
    col("source_section_fraction", V2, Extract::F32(|t| t.pre_section_fraction)),
    col("target_section_fraction", V2, Extract::F32(|t| t.post_section_fraction)),
    col("source_position_x", V2, Extract::F32(|t| t.pre_position[0])),
    col("source_position_y", V2, Extract::F32(|t| t.pre_position[1])),
    col("source_position_z", V2, Extract::F32(|t| t.pre_position[2])),
    col("target_position_x", V2, Extract::F32(|t| t.post_position[0])),
    col("target_position_y", V2, Extract::F32(|t| t.post_position[1])),
    col("target_position_z", V2, Extract::F32(|t| t.post_position[2])),
    col("spine_length", V2, Extract::F32(|t| t.spine_length)),
    col("branch_type", V2, Extract::U8(|t| t.branch_type)),
    col("source_center_x", V3, Extract::F32(|t| t.pre_position_center[0])),
    col("source_center_y", V3, Extract::F32(|t| t.pre_position_center[1])),
    col("source_center_z", V3, Extract::F32(|t| t.pre_position_center[2])),
    col("target_surface_x", V3, Extract::F32(|t| t.post_position_surface[0])),
    col("target_surface_y", V3, Extract::F32(|t| t.post_position_surface[1])),
    col("target_surface_z", V3, Extract::F32(|t| t.post_position_surface[2])),
    col("synapse_index", V1, Extract::I64(|t| t.synapse_index as i64)),
];

/// Builds [`Table`]s from blocks of [`IndexedTouch`] records.
///
/// The column set depends only on the layout version and the optional
/// projection, so every process configured alike derives the same schema.
#[derive(Clone)]
pub struct TouchTableBuilder {
    version: LayoutVersion,
    columns: Vec<&'static TouchColumn>,
}

impl std::fmt::Debug for TouchTableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TouchTableBuilder")
            .field("version", &self.version)
            .field("columns", &self.columns.iter().map(|c| c.name).collect::<Vec<_>>())
            .finish()
    }
}

impl TouchTableBuilder {
    /// All columns available for `version`.
    pub fn new(version: LayoutVersion) -> Self {
        Self {
            version,
            columns: TOUCH_COLUMNS.iter().filter(|c| c.since <= version).collect(),
        }
    }

    /// Restricts the output to the named columns, kept in schema order.
    pub fn with_projection<S: AsRef<str>>(
        version: LayoutVersion,
        names: &[S],
    ) -> Result<Self, TableError> {
        if names.is_empty() {
            return Err(TableError::EmptyProjection);
        }
        let all = Self::new(version);
        for name in names {
            let name = name.as_ref();
            if !all.columns.iter().any(|c| c.name == name) {
                return Err(TableError::UnknownColumn {
                    name: name.to_string(),
                    version,
                });
            }
        }
        Ok(Self {
            version,
            columns: all
                .columns
                .into_iter()
                .filter(|c| names.iter().any(|n| n.as_ref() == c.name))
                .collect(),
        })
    }

    pub fn version(&self) -> LayoutVersion {
        self.version
    }

    /// Schema of every table this builder produces.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(c.name, c.extract.column_type()))
                .collect(),
        )
    }

    /// Converts one block of records into a table.
    pub fn build(&self, block: &[IndexedTouch]) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnBatch {
                    name: c.name.to_string(),
                    data: c.extract.collect(block),
                })
                .collect(),
        }
    }
}
