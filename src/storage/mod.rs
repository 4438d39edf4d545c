//! Dataset storage.
//!
//! Every output column is one fixed-length, fixed-width dataset. The writer
//! pool only sees the [`StorageBackend`] / [`DatasetHandle`] pair; the
//! concrete backend here, [`FileStorage`], keeps one file per dataset.
//!
//! # File layout
//!
//! ```text
//! [MAGIC "TDS1"][FORMAT_VERSION u32][element tag u8][row_width u32][length u64]
//! [name: u32 len + utf-8][crc32 u32]
//! [zero padding up to DATA_ALIGN]
//! [length * row_width elements, little-endian]
//! ```
//!
//! The CRC covers every header byte before it. The file is sized to its full
//! logical length at creation, so each process can write its own window at
//! absolute offsets without coordinating with the others.
//!
//! # Collective creation
//!
//! With [`FileStorage::collective`], creating a dataset is a synchronizing
//! operation: the root creates and sizes the file, all ranks meet at a
//! barrier, then every rank opens it for writing. Without it, every caller
//! creates the file idempotently (no truncation, identical header bytes).

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::coordination::{CoordError, CoordinationGroup, OffsetWindow, ROOT};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::table::{ColumnData, ColumnType};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Leading bytes of every dataset file.
pub const MAGIC: [u8; 4] = *b"TDS1";

/// Current header format.
pub const FORMAT_VERSION: u32 = 1;

/// Alignment of the first data byte.
pub const DATA_ALIGN: u64 = 64;

/// File extension of dataset files.
pub const DATASET_EXT: &str = "ds";

const CRC_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Header encoding or decoding failed.
    #[error("header encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// File does not start with [`MAGIC`].
    #[error("{path} is not a dataset file")]
    BadMagic { path: PathBuf },

    /// Header written by an unknown format.
    #[error("{path}: unsupported format version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    /// Header bytes do not match their checksum.
    #[error("{path}: header checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch {
        path: PathBuf,
        stored: u32,
        computed: u32,
    },

    /// File shorter than its header claims.
    #[error("{path}: truncated (expected {expected} bytes, found {actual})")]
    Truncated {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Column type without an element storage type.
    #[error("column type {0:?} has no storage element type")]
    UnmappedType(ColumnType),

    /// Data of the wrong type for the dataset.
    #[error("dataset {name}: expected {expected:?} data, got {actual:?}")]
    TypeMismatch {
        name: String,
        expected: ElementType,
        actual: ColumnType,
    },

    /// Value count not a multiple of the row width.
    #[error("dataset {name}: {values} values do not form rows of width {row_width}")]
    RowWidth {
        name: String,
        values: usize,
        row_width: u32,
    },

    /// Write outside this handle's window.
    #[error("dataset {name}: rows [{offset}, {offset}+{rows}) outside window {window:?}")]
    OutsideWindow {
        name: String,
        offset: u64,
        rows: u64,
        window: OffsetWindow,
    },

    /// Invalid dataset definition.
    #[error("invalid dataset '{name}': {reason}")]
    InvalidSpec { name: String, reason: String },

    /// Collective creation failed.
    #[error("coordination failed: {0}")]
    Coordination(#[from] CoordError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ------------------------------------------------------------------------------------------------
// Element types
// ------------------------------------------------------------------------------------------------

/// Fixed-width storage type of a dataset element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ElementType {
    /// Width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Tag byte stored in the header.
    pub const fn tag(self) -> u8 {
        match self {
            Self::I8 => 0,
            Self::U8 => 1,
            Self::I16 => 2,
            Self::U16 => 3,
            Self::I32 => 4,
            Self::U32 => 5,
            Self::I64 => 6,
            Self::U64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::I8,
            1 => Self::U8,
            2 => Self::I16,
            3 => Self::U16,
            4 => Self::I32,
            5 => Self::U32,
            6 => Self::I64,
            7 => Self::U64,
            8 => Self::F32,
            9 => Self::F64,
            _ => return None,
        })
    }

    /// Storage type of a column type.
    ///
    /// `Boolean` and `Utf8` have no fixed-width mapping.
    pub fn from_column_type(ty: ColumnType) -> Result<Self, StorageError> {
        Ok(match ty {
            ColumnType::Int8 => Self::I8,
            ColumnType::UInt8 => Self::U8,
            ColumnType::Int16 => Self::I16,
            ColumnType::UInt16 => Self::U16,
            ColumnType::Int32 => Self::I32,
            ColumnType::UInt32 => Self::U32,
            ColumnType::Int64 => Self::I64,
            ColumnType::UInt64 => Self::U64,
            ColumnType::Float32 => Self::F32,
            ColumnType::Float64 => Self::F64,
            ColumnType::Boolean | ColumnType::Utf8 => {
                return Err(StorageError::UnmappedType(ty));
            }
        })
    }

    /// Column type the elements read back as.
    pub fn column_type(self) -> ColumnType {
        match self {
            Self::I8 => ColumnType::Int8,
            Self::U8 => ColumnType::UInt8,
            Self::I16 => ColumnType::Int16,
            Self::U16 => ColumnType::UInt16,
            Self::I32 => ColumnType::Int32,
            Self::U32 => ColumnType::UInt32,
            Self::I64 => ColumnType::Int64,
            Self::U64 => ColumnType::UInt64,
            Self::F32 => ColumnType::Float32,
            Self::F64 => ColumnType::Float64,
        }
    }
}

/// Little-endian bytes of fixed-width column data; `None` for unmapped types.
fn element_bytes(data: &ColumnData) -> Option<Vec<u8>> {
    fn le<T: Copy, const N: usize>(values: &[T], f: fn(T) -> [u8; N]) -> Vec<u8> {
        values.iter().flat_map(|v| f(*v)).collect()
    }
    Some(match data {
        ColumnData::Int8(v) => le(v, i8::to_le_bytes),
        ColumnData::UInt8(v) => v.clone(),
        ColumnData::Int16(v) => le(v, i16::to_le_bytes),
        ColumnData::UInt16(v) => le(v, u16::to_le_bytes),
        ColumnData::Int32(v) => le(v, i32::to_le_bytes),
        ColumnData::UInt32(v) => le(v, u32::to_le_bytes),
        ColumnData::Int64(v) => le(v, i64::to_le_bytes),
        ColumnData::UInt64(v) => le(v, u64::to_le_bytes),
        ColumnData::Float32(v) => le(v, f32::to_le_bytes),
        ColumnData::Float64(v) => le(v, f64::to_le_bytes),
        ColumnData::Boolean(_) | ColumnData::Utf8(_) => return None,
    })
}

/// Decodes `bytes` (a whole number of elements) into column data.
fn decode_elements(element: ElementType, bytes: &[u8]) -> ColumnData {
    fn de<T, const N: usize>(bytes: &[u8], f: fn([u8; N]) -> T) -> Vec<T> {
        bytes
            .chunks_exact(N)
            .map(|chunk| {
                let mut arr = [0u8; N];
                arr.copy_from_slice(chunk);
                f(arr)
            })
            .collect()
    }
    match element {
        ElementType::I8 => ColumnData::Int8(de(bytes, i8::from_le_bytes)),
        ElementType::U8 => ColumnData::UInt8(bytes.to_vec()),
        ElementType::I16 => ColumnData::Int16(de(bytes, i16::from_le_bytes)),
        ElementType::U16 => ColumnData::UInt16(de(bytes, u16::from_le_bytes)),
        ElementType::I32 => ColumnData::Int32(de(bytes, i32::from_le_bytes)),
        ElementType::U32 => ColumnData::UInt32(de(bytes, u32::from_le_bytes)),
        ElementType::I64 => ColumnData::Int64(de(bytes, i64::from_le_bytes)),
        ElementType::U64 => ColumnData::UInt64(de(bytes, u64::from_le_bytes)),
        ElementType::F32 => ColumnData::Float32(de(bytes, f32::from_le_bytes)),
        ElementType::F64 => ColumnData::Float64(de(bytes, f64::from_le_bytes)),
    }
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Self-describing header of a dataset file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHeader {
    pub name: String,
    pub element: ElementType,
    pub row_width: u32,

    /// Logical length in rows.
    pub length: u64,
}

impl DatasetHeader {
    /// Offset of the first data byte for a header of `header_len` bytes.
    fn data_offset(header_len: usize) -> u64 {
        (header_len as u64).div_ceil(DATA_ALIGN) * DATA_ALIGN
    }

    /// Bytes occupied by the data section.
    pub fn data_len(&self) -> u64 {
        self.length * u64::from(self.row_width) * self.element.width() as u64
    }

    /// Header bytes including the trailing CRC.
    fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = encoding::encode_to_vec(self)?;
        let crc = crc32fast::hash(&buf);
        crc.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Parses and verifies a header. Returns it with the data offset.
    fn parse(path: &Path, buf: &[u8]) -> Result<(Self, u64), StorageError> {
        if buf.len() < MAGIC.len() || buf[..MAGIC.len()] != MAGIC {
            return Err(StorageError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let (version, _) = u32::decode_from(&buf[MAGIC.len()..])?;
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }

        let (header, consumed) = encoding::decode_from_slice::<DatasetHeader>(buf)?;
        let (stored, _) = u32::decode_from(&buf[consumed..])?;
        let computed = crc32fast::hash(&buf[..consumed]);
        if stored != computed {
            return Err(StorageError::ChecksumMismatch {
                path: path.to_path_buf(),
                stored,
                computed,
            });
        }
        Ok((header, Self::data_offset(consumed + CRC_SIZE)))
    }
}

impl Encode for DatasetHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        MAGIC.encode_to(buf)?;
        FORMAT_VERSION.encode_to(buf)?;
        self.element.tag().encode_to(buf)?;
        self.row_width.encode_to(buf)?;
        self.length.encode_to(buf)?;
        self.name.encode_to(buf)
    }
}

impl Decode for DatasetHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (_magic, n) = <[u8; 4]>::decode_from(buf)?;
        offset += n;
        let (_version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (tag, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let element = ElementType::from_tag(tag).ok_or(EncodingError::InvalidTag {
            tag: u32::from(tag),
            type_name: "ElementType",
        })?;
        let (row_width, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (length, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                name,
                element,
                row_width,
                length,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Backend interface
// ------------------------------------------------------------------------------------------------

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Slash-separated dataset path, e.g. `default/source_node_id`.
    pub name: String,
    pub element: ElementType,
    pub row_width: u32,

    /// Global length in rows.
    pub length: u64,

    /// Rows the created handle may write.
    pub window: OffsetWindow,
}

impl DatasetSpec {
    /// One-value-per-row dataset.
    pub fn column(
        name: impl Into<String>,
        element: ElementType,
        length: u64,
        window: OffsetWindow,
    ) -> Self {
        Self {
            name: name.into(),
            element,
            row_width: 1,
            length,
            window,
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        let invalid = |reason: &str| {
            Err(StorageError::InvalidSpec {
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        if self.name.is_empty() || self.name.split('/').any(|p| p.is_empty() || p == "..") {
            return invalid("name must be non-empty path segments");
        }
        if self.row_width == 0 {
            return invalid("row width must be at least 1");
        }
        if self.window.end() > self.length {
            return invalid("window extends past the dataset length");
        }
        Ok(())
    }
}

/// Creates datasets.
pub trait StorageBackend: Send + Sync {
    type Handle: DatasetHandle + 'static;

    /// Creates (or joins the collective creation of) a dataset.
    fn create_dataset(&self, spec: &DatasetSpec) -> Result<Self::Handle, StorageError>;
}

/// Write access to one dataset, owned by exactly one writer at a time.
pub trait DatasetHandle: Send {
    fn name(&self) -> &str;

    /// Writes `data` starting at row `offset`.
    fn write_at(&mut self, offset: u64, data: &ColumnData) -> Result<(), StorageError>;

    /// Flushes and releases the dataset.
    fn close(self) -> Result<(), StorageError>;
}

// ------------------------------------------------------------------------------------------------
// File backend
// ------------------------------------------------------------------------------------------------

/// One file per dataset under a root directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    group: Option<Arc<dyn CoordinationGroup>>,
}

impl FileStorage {
    /// Independent creation: every caller opens or creates the file itself.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            group: None,
        }
    }

    /// Collective creation across `group`.
    pub fn collective(root: impl Into<PathBuf>, group: Arc<dyn CoordinationGroup>) -> Self {
        Self {
            root: root.into(),
            group: Some(group),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path of the dataset `name`.
    pub fn dataset_path(&self, name: &str) -> PathBuf {
        dataset_path(&self.root, name)
    }

    /// Creates the file, writes the header, and sizes it to its full length.
    fn initialize(
        path: &Path,
        header: &DatasetHeader,
        truncate: bool,
    ) -> Result<u64, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let bytes = header.to_bytes()?;
        let data_offset = DatasetHeader::data_offset(bytes.len());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .map_err(io_error(path))?;
        file.write_all_at(&bytes, 0).map_err(io_error(path))?;
        file.set_len(data_offset + header.data_len())
            .map_err(io_error(path))?;
        Ok(data_offset)
    }

    fn open_for_write(path: &Path) -> Result<File, StorageError> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(io_error(path))
    }
}

/// File path of dataset `name` under `root`.
pub fn dataset_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.{DATASET_EXT}"))
}

impl StorageBackend for FileStorage {
    type Handle = FileDataset;

    fn create_dataset(&self, spec: &DatasetSpec) -> Result<FileDataset, StorageError> {
        spec.validate()?;
        let path = self.dataset_path(&spec.name);
        let header = DatasetHeader {
            name: spec.name.clone(),
            element: spec.element,
            row_width: spec.row_width,
            length: spec.length,
        };

        let (file, data_offset) = match &self.group {
            None => {
                let data_offset = Self::initialize(&path, &header, false)?;
                (Self::open_for_write(&path)?, data_offset)
            }
            Some(group) => {
                let created = if group.rank() == ROOT {
                    Self::initialize(&path, &header, true).map(Some)
                } else {
                    Ok(None)
                };
                if created.is_err() {
                    group.abort();
                }
                let created = created?;
                group.barrier()?;
                let data_offset = match created {
                    Some(offset) => offset,
                    None => DatasetHeader::data_offset(header.to_bytes()?.len()),
                };
                (Self::open_for_write(&path)?, data_offset)
            }
        };

        debug!(
            dataset = %spec.name,
            path = %path.display(),
            length = spec.length,
            window_offset = spec.window.offset,
            window_len = spec.window.len,
            "dataset created"
        );

        Ok(FileDataset {
            name: spec.name.clone(),
            path,
            file,
            element: spec.element,
            row_width: spec.row_width,
            data_offset,
            window: spec.window,
        })
    }
}

/// Writable handle to one dataset file.
#[derive(Debug)]
pub struct FileDataset {
    name: String,
    path: PathBuf,
    file: File,
    element: ElementType,
    row_width: u32,
    data_offset: u64,
    window: OffsetWindow,
}

impl FileDataset {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn window(&self) -> OffsetWindow {
        self.window
    }
}

impl DatasetHandle for FileDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_at(&mut self, offset: u64, data: &ColumnData) -> Result<(), StorageError> {
        if data.column_type() != self.element.column_type() {
            return Err(StorageError::TypeMismatch {
                name: self.name.clone(),
                expected: self.element,
                actual: data.column_type(),
            });
        }
        if data.len() % self.row_width as usize != 0 {
            return Err(StorageError::RowWidth {
                name: self.name.clone(),
                values: data.len(),
                row_width: self.row_width,
            });
        }
        let rows = (data.len() / self.row_width as usize) as u64;
        if !self.window.contains(offset, rows) {
            return Err(StorageError::OutsideWindow {
                name: self.name.clone(),
                offset,
                rows,
                window: self.window,
            });
        }

        let bytes = element_bytes(data).ok_or(StorageError::UnmappedType(data.column_type()))?;
        let row_bytes = u64::from(self.row_width) * self.element.width() as u64;
        let position = self.data_offset + offset * row_bytes;
        trace!(dataset = %self.name, offset, rows, position, "write");
        self.file
            .write_all_at(&bytes, position)
            .map_err(io_error(&self.path))
    }

    fn close(self) -> Result<(), StorageError> {
        self.file.sync_data().map_err(io_error(&self.path))?;
        debug!(dataset = %self.name, "dataset closed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reading
// ------------------------------------------------------------------------------------------------

/// Read-only, memory-mapped view of a dataset file.
pub struct Dataset {
    path: PathBuf,
    header: DatasetHeader,
    data_offset: usize,
    mmap: Mmap,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl Dataset {
    /// Opens and verifies a dataset file.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. Datasets are only read after every
    /// writer has closed them, and the mapping is read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(io_error(path))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_error(path))?;

        let (header, data_offset) = DatasetHeader::parse(path, &mmap)?;
        let expected = data_offset + header.data_len();
        if (mmap.len() as u64) < expected {
            return Err(StorageError::Truncated {
                path: path.to_path_buf(),
                expected,
                actual: mmap.len() as u64,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            data_offset: data_offset as usize,
            mmap,
        })
    }

    /// Opens dataset `name` under `root`.
    pub fn open_in(root: &Path, name: &str) -> Result<Self, StorageError> {
        Self::open(dataset_path(root, name))
    }

    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    /// Length in rows.
    pub fn len(&self) -> u64 {
        self.header.length
    }

    pub fn is_empty(&self) -> bool {
        self.header.length == 0
    }

    /// Raw little-endian data bytes.
    pub fn bytes(&self) -> &[u8] {
        let end = self.data_offset + self.header.data_len() as usize;
        &self.mmap[self.data_offset..end]
    }

    /// Every element, row-major.
    pub fn read(&self) -> ColumnData {
        decode_elements(self.header.element, self.bytes())
    }

    /// Elements of rows `[start, start + rows)`, clamped to the length.
    pub fn read_rows(&self, start: u64, rows: u64) -> ColumnData {
        let row_bytes = self.header.row_width as usize * self.header.element.width();
        let start = start.min(self.len()) as usize;
        let end = start + (rows as usize).min(self.len() as usize - start);
        decode_elements(
            self.header.element,
            &self.bytes()[start * row_bytes..end * row_bytes],
        )
    }
}
