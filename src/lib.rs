//! # touch2sonata
//!
//! Converts fixed-record binary touch files (synapse connectivity) into
//! one dataset per column, with any number of cooperating processes
//! writing disjoint, correctly ordered regions of the same output.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use touch2sonata::{ConvertConfig, LayoutVersion, pipeline};
//!
//! let config = ConvertConfig {
//!     layout: LayoutVersion::V2,
//!     population: "All".into(),
//!     ..ConvertConfig::default()
//! };
//! let inputs = vec![PathBuf::from("touches_0"), PathBuf::from("touches_1")];
//!
//! // Four ranks, each converting a share of the files.
//! let reports = pipeline::convert(&inputs, "/tmp/out".as_ref(), &config, 4).unwrap();
//! assert_eq!(reports.len(), 4);
//! ```
//!
//! ## Pipeline
//!
//! - **Reader**: buffered, endian-aware block reads of fixed-size records.
//! - **Coordination**: all-reduce / gather / scatter fix every process's
//!   output window before any data moves.
//! - **Writer pool**: one storage thread per column, fed through bounded
//!   zero-copy queues.
//! - **Index**: optional source/target range indices written by the root.

pub mod converter;
pub mod coordination;
pub mod encoding;
pub mod index;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod record;
pub mod storage;
pub mod table;
pub mod writer;

use std::path::PathBuf;

use thiserror::Error;

pub use converter::{BlockReader, BlockWriter, ConvertError, Converter, ProgressMonitor};
pub use coordination::{CoordError, CoordinationGroup, ExecContext, LocalGroup, SoloGroup};
pub use index::IndexError;
pub use reader::{ReaderError, TouchReader};
pub use record::{IndexedTouch, LayoutVersion, Touch};
pub use storage::{Dataset, FileStorage, StorageError};
pub use table::{TableError, TouchTableBuilder};
pub use writer::{ColumnWriterPool, WriterError};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// How input is divided between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partition {
    /// Whole files per process; the first `n % size` processes take one
    /// extra file.
    #[default]
    Files,

    /// Every file split into `ceil(count / size)`-record slices, one per
    /// process.
    Records,
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Files => f.write_str("files"),
            Self::Records => f.write_str("records"),
        }
    }
}

impl std::str::FromStr for Partition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "files" => Ok(Self::Files),
            "records" => Ok(Self::Records),
            other => Err(Error::InvalidConfig(format!(
                "unknown partition '{other}' (expected files or records)"
            ))),
        }
    }
}

/// Configuration of a conversion run.
///
/// Every process of a run must use the same configuration.
///
/// # Example
///
/// ```rust
/// use touch2sonata::{ConvertConfig, LayoutVersion, Partition};
///
/// let config = ConvertConfig {
///     layout: LayoutVersion::V1,
///     partition: Partition::Records,
///     columns: Some(vec!["source_node_id".into(), "target_node_id".into()]),
///     ..ConvertConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertConfig {
    /// Record layout of the input files.
    ///
    /// Default: V3.
    pub layout: LayoutVersion,

    /// Swap the byte order of every record word on load.
    ///
    /// Default: false.
    pub endian_swap: bool,

    /// Default: [`Partition::Files`].
    pub partition: Partition,

    /// Population name; datasets land in `<output>/<population>/`.
    ///
    /// Default: `"default"`. Must be non-empty and free of `/`.
    pub population: String,

    /// Columns to write, `None` for all of the layout's columns.
    pub columns: Option<Vec<String>>,

    /// Batches buffered per column before the converter blocks.
    ///
    /// Default: 16. Must be ≥ 1.
    pub queue_capacity: usize,

    /// Write source/target range indices after conversion.
    ///
    /// Default: true. Needs `source_node_id` and `target_node_id`.
    pub create_index: bool,

    /// Create datasets collectively when running with several processes.
    ///
    /// Default: true.
    pub collective_io: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            layout: LayoutVersion::default(),
            endian_swap: false,
            partition: Partition::default(),
            population: "default".into(),
            columns: None,
            queue_capacity: 16,
            create_index: true,
            collective_io: true,
        }
    }
}

impl ConvertConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if self.queue_capacity < 1 {
            return Err(Error::InvalidConfig("queue_capacity must be >= 1".into()));
        }
        if self.population.is_empty() {
            return Err(Error::InvalidConfig("population must not be empty".into()));
        }
        if self.population.contains('/') {
            return Err(Error::InvalidConfig(
                "population must not contain '/'".into(),
            ));
        }
        let schema = self.table_builder()?.schema();
        if self.create_index {
            for column in [index::SOURCE_COLUMN, index::TARGET_COLUMN] {
                if schema.field(column).is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "indexing needs column '{column}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Table builder for the configured layout and projection.
    pub fn table_builder(&self) -> Result<TouchTableBuilder, Error> {
        match &self.columns {
            None => Ok(TouchTableBuilder::new(self.layout)),
            Some(columns) => TouchTableBuilder::with_projection(self.layout, columns)
                .map_err(|e| Error::InvalidConfig(e.to_string())),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by a conversion run.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No input files were given.
    #[error("no input files")]
    NoInputs,

    /// Listing or inspecting inputs failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A process without work could not confirm the input layout.
    #[error("schema unavailable from {path}: {reason}")]
    SchemaUnavailable { path: PathBuf, reason: String },

    #[error("{0}")]
    Read(#[from] ReaderError),

    #[error("{0}")]
    Convert(#[from] ConvertError),

    #[error("{0}")]
    Write(#[from] WriterError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Coordination(#[from] CoordError),

    #[error("{0}")]
    Index(#[from] IndexError),

    #[error("{0}")]
    Table(#[from] TableError),

    /// A simulated rank panicked.
    #[error("rank {0} panicked")]
    RankPanicked(usize),
}

impl Error {
    /// Whether this error only reports that another process gave up.
    pub fn is_abort(&self) -> bool {
        fn storage(e: &StorageError) -> bool {
            matches!(e, StorageError::Coordination(CoordError::Aborted))
        }
        match self {
            Self::Coordination(CoordError::Aborted) => true,
            Self::Storage(e) => storage(e),
            Self::Write(WriterError::Storage(e)) => storage(e),
            Self::Convert(ConvertError::Write(WriterError::Storage(e))) => storage(e),
            _ => false,
        }
    }
}
