//! Edge indices.
//!
//! After conversion, the root process writes two lookup structures per
//! population, one keyed by source node and one by target node:
//!
//! ```text
//! indices/source_to_target/node_id_to_ranges   [node_count, 2]  -> rows of range_to_edge_id
//! indices/source_to_target/range_to_edge_id    [range_count, 2] -> [first_edge, end_edge)
//! indices/target_to_source/...                 same, keyed by target_node_id
//! ```
//!
//! A range is a maximal run of consecutive edges sharing the node id. Ranges
//! are grouped by node, in edge order within a node. Nodes without edges map
//! to the empty range `[0, 0)`.

#[cfg(test)]
mod tests;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::coordination::OffsetWindow;
use crate::storage::{
    Dataset, DatasetHandle, DatasetSpec, ElementType, FileStorage, StorageBackend, StorageError,
};
use crate::table::ColumnData;

pub const SOURCE_COLUMN: &str = "source_node_id";
pub const TARGET_COLUMN: &str = "target_node_id";

/// Errors raised while building indices.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// Node ids must be non-negative integers.
    #[error("column '{column}' has unsupported type for node ids")]
    UnsupportedType { column: String },

    #[error("column '{column}': negative node id {value} at edge {edge}")]
    NegativeNodeId {
        column: String,
        value: i64,
        edge: u64,
    },

    #[error("column '{column}': node id {value} at edge {edge} exceeds node count {node_count}")]
    NodeOutOfRange {
        column: String,
        value: u64,
        edge: u64,
        node_count: u64,
    },

    #[error("source and target columns differ in length ({source_len} vs {target_len})")]
    LengthMismatch { source_len: u64, target_len: u64 },
}

/// One direction of the index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EdgeIndex {
    /// Per node: `[first_range, end_range)` into `ranges`.
    pub node_to_ranges: Vec<[u64; 2]>,

    /// Per range: `[first_edge, end_edge)`.
    pub ranges: Vec<[u64; 2]>,
}

impl EdgeIndex {
    /// Builds the index of `node_ids` (one per edge, in edge order).
    ///
    /// Every id must be below `node_count`.
    pub fn build(node_ids: &[u64], node_count: u64) -> Self {
        // Runs of equal ids in edge order.
        let mut runs: Vec<(u64, [u64; 2])> = Vec::new();
        for (edge, &node) in (0u64..).zip(node_ids) {
            match runs.last_mut() {
                Some((last, range)) if *last == node => range[1] = edge + 1,
                _ => runs.push((node, [edge, edge + 1])),
            }
        }

        // Stable counting sort of runs by node.
        let mut counts = vec![0u64; node_count as usize];
        for (node, _) in &runs {
            counts[*node as usize] += 1;
        }
        let mut node_to_ranges = Vec::with_capacity(counts.len());
        let mut next = 0u64;
        for count in &counts {
            node_to_ranges.push(if *count == 0 {
                [0, 0]
            } else {
                [next, next + count]
            });
            next += count;
        }

        let mut fill: Vec<u64> = node_to_ranges.iter().map(|r| r[0]).collect();
        let mut ranges = vec![[0u64; 2]; runs.len()];
        for (node, range) in runs {
            let slot = &mut fill[node as usize];
            ranges[*slot as usize] = range;
            *slot += 1;
        }

        Self {
            node_to_ranges,
            ranges,
        }
    }
}

/// Node counts per direction; `None` means `max(id) + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCounts {
    pub source: Option<u64>,
    pub target: Option<u64>,
}

/// What [`write_indices`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    pub edges: u64,
    pub source_nodes: u64,
    pub target_nodes: u64,
}

/// Reads a node id column as unsigned ids.
fn node_ids(column: &str, data: ColumnData) -> Result<Vec<u64>, IndexError> {
    fn signed<T: Into<i64> + Copy>(column: &str, values: &[T]) -> Result<Vec<u64>, IndexError> {
        (0u64..)
            .zip(values)
            .map(|(edge, v)| {
                let value: i64 = (*v).into();
                u64::try_from(value).map_err(|_| IndexError::NegativeNodeId {
                    column: column.to_string(),
                    value,
                    edge,
                })
            })
            .collect()
    }

    match data {
        ColumnData::Int8(v) => signed(column, &v),
        ColumnData::Int16(v) => signed(column, &v),
        ColumnData::Int32(v) => signed(column, &v),
        ColumnData::Int64(v) => signed(column, &v),
        ColumnData::UInt8(v) => Ok(v.into_iter().map(u64::from).collect()),
        ColumnData::UInt16(v) => Ok(v.into_iter().map(u64::from).collect()),
        ColumnData::UInt32(v) => Ok(v.into_iter().map(u64::from).collect()),
        ColumnData::UInt64(v) => Ok(v),
        _ => Err(IndexError::UnsupportedType {
            column: column.to_string(),
        }),
    }
}

/// Resolves the node count and checks every id against it.
fn node_count(column: &str, ids: &[u64], requested: Option<u64>) -> Result<u64, IndexError> {
    let implied = ids.iter().max().map_or(0, |max| max + 1);
    let Some(count) = requested else {
        return Ok(implied);
    };
    if let Some(edge) = ids.iter().position(|id| *id >= count) {
        return Err(IndexError::NodeOutOfRange {
            column: column.to_string(),
            value: ids[edge],
            edge: edge as u64,
            node_count: count,
        });
    }
    Ok(count)
}

fn write_pairs(
    storage: &FileStorage,
    name: String,
    pairs: &[[u64; 2]],
) -> Result<(), StorageError> {
    let rows = pairs.len() as u64;
    let spec = DatasetSpec {
        row_width: 2,
        ..DatasetSpec::column(name, ElementType::U64, rows, OffsetWindow::full(rows))
    };
    let mut handle = storage.create_dataset(&spec)?;
    let flat = pairs.iter().flatten().copied().collect();
    handle.write_at(0, &ColumnData::UInt64(flat))?;
    handle.close()
}

fn write_direction(
    storage: &FileStorage,
    population: &str,
    direction: &str,
    index: &EdgeIndex,
) -> Result<(), StorageError> {
    let base = format!("{population}/indices/{direction}");
    write_pairs(storage, format!("{base}/node_id_to_ranges"), &index.node_to_ranges)?;
    write_pairs(storage, format!("{base}/range_to_edge_id"), &index.ranges)?;
    debug!(
        population,
        direction,
        nodes = index.node_to_ranges.len(),
        ranges = index.ranges.len(),
        "index written"
    );
    Ok(())
}

/// Builds and writes both index directions for `population` under `root`.
///
/// Runs on one process only; the other processes wait at a barrier.
pub fn write_indices(
    root: &Path,
    population: &str,
    counts: NodeCounts,
) -> Result<IndexSummary, IndexError> {
    let source_column = format!("{population}/{SOURCE_COLUMN}");
    let target_column = format!("{population}/{TARGET_COLUMN}");
    let sources = node_ids(&source_column, Dataset::open_in(root, &source_column)?.read())?;
    let targets = node_ids(&target_column, Dataset::open_in(root, &target_column)?.read())?;
    if sources.len() != targets.len() {
        return Err(IndexError::LengthMismatch {
            source_len: sources.len() as u64,
            target_len: targets.len() as u64,
        });
    }

    let source_nodes = node_count(&source_column, &sources, counts.source)?;
    let target_nodes = node_count(&target_column, &targets, counts.target)?;

    let storage = FileStorage::new(root);
    write_direction(
        &storage,
        population,
        "source_to_target",
        &EdgeIndex::build(&sources, source_nodes),
    )?;
    write_direction(
        &storage,
        population,
        "target_to_source",
        &EdgeIndex::build(&targets, target_nodes),
    )?;

    let summary = IndexSummary {
        edges: sources.len() as u64,
        source_nodes,
        target_nodes,
    };
    info!(
        population,
        edges = summary.edges,
        source_nodes,
        target_nodes,
        "indices written"
    );
    Ok(summary)
}
