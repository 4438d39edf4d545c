//! Per-rank conversion driver.
//!
//! [`convert_rank`] is what every process runs. In order:
//!
//! 1. validate the configuration and pick this rank's input segments;
//! 2. a rank without segments probes the last input so that every rank
//!    has checked the layout before collective work begins;
//! 3. run the offset protocol to fix this rank's output window;
//! 4. create the datasets (collectively when several ranks share them)
//!    and convert every segment block by block;
//! 5. close the column writers, synchronize, and optionally let the root
//!    write the edge indices.
//!
//! A rank that fails aborts the coordination group, so its peers fail
//! promptly instead of waiting in the next collective.


use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::converter::{BUFFER_LEN, Converter, ProgressMonitor};
use crate::coordination::{CoordinationGroup, ExecContext, LocalGroup, OffsetPlan, coordinate};
use crate::index::{self, IndexSummary, NodeCounts};
use crate::reader::{self, TouchReader};
use crate::storage::FileStorage;
use crate::writer::{ColumnWriterPool, OutputLayout, PoolConfig, TouchTableWriter};
use crate::{ConvertConfig, Error, LayoutVersion, Partition};

/// A contiguous record range of one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub start: u64,
    pub count: u64,
}

/// What one rank did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankReport {
    pub plan: OffsetPlan,

    /// Columns written, in schema order.
    pub columns: Vec<String>,

    /// Present on the root when indices were written.
    pub index: Option<IndexSummary>,
}

// ------------------------------------------------------------------------------------------------
// Partitioning
// ------------------------------------------------------------------------------------------------

/// Splits the inputs between `size` ranks and returns `rank`'s share.
///
/// `counts[i]` is the record count of `inputs[i]`. Segments are returned in
/// input order and every record belongs to exactly one rank. Under
/// [`Partition::Files`] the ranks' segments concatenated in rank order are
/// the inputs in order; under [`Partition::Records`] each rank holds one
/// slice of every file large enough to reach it.
pub fn assign_segments(
    inputs: &[PathBuf],
    counts: &[u64],
    rank: usize,
    size: usize,
    partition: Partition,
) -> Vec<Segment> {
    match partition {
        Partition::Files => {
            let files = file_range(inputs.len(), rank, size);
            inputs[files.clone()]
                .iter()
                .zip(&counts[files])
                .map(|(path, count)| Segment {
                    path: path.clone(),
                    start: 0,
                    count: *count,
                })
                .collect()
        }
        Partition::Records => inputs
            .iter()
            .zip(counts)
            .filter_map(|(path, count)| {
                let unit = count.div_ceil(size as u64);
                let start = (unit * rank as u64).min(*count);
                let end = (start + unit).min(*count);
                (end > start).then(|| Segment {
                    path: path.clone(),
                    start,
                    count: end - start,
                })
            })
            .collect(),
    }
}

/// Indices of the files `rank` converts under [`Partition::Files`].
///
/// The first `n % size` ranks take one file more than the rest.
fn file_range(n: usize, rank: usize, size: usize) -> Range<usize> {
    let base = n / size;
    let extra = n % size;
    let first = base * rank + rank.min(extra);
    first..first + base + usize::from(rank < extra)
}

/// Number of whole records in a touch file.
fn record_count(path: &Path, layout: LayoutVersion) -> Result<u64, Error> {
    let len = std::fs::metadata(path)
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    Ok(len / layout.record_size() as u64)
}

/// Confirms the input can be read with the configured layout.
fn probe_schema(path: &Path, config: &ConvertConfig) -> Result<(), Error> {
    let unavailable = |reason: String| Error::SchemaUnavailable {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = TouchReader::open(path, config.layout, config.endian_swap)
        .map_err(|e| unavailable(e.to_string()))?;
    if reader.record_count() == 0 {
        return Err(unavailable("file holds no complete record".into()));
    }
    reader.get_next().map_err(|e| unavailable(e.to_string()))?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Driver
// ------------------------------------------------------------------------------------------------

/// Converts this rank's share of `inputs` into `output`.
///
/// Every rank of `ctx` must call this with the same inputs and config.
pub fn convert_rank(
    ctx: &ExecContext,
    inputs: &[PathBuf],
    output: &Path,
    config: &ConvertConfig,
) -> Result<RankReport, Error> {
    let result = run_rank(ctx, inputs, output, config);
    if let Err(e) = &result {
        if e.is_abort() {
            warn!(rank = ctx.rank(), "conversion aborted by another rank");
        } else {
            error!(rank = ctx.rank(), error = %e, "conversion failed");
        }
        ctx.group().abort();
    }
    result
}

fn run_rank(
    ctx: &ExecContext,
    inputs: &[PathBuf],
    output: &Path,
    config: &ConvertConfig,
) -> Result<RankReport, Error> {
    let (rank, size) = (ctx.rank(), ctx.size());
    config.validate()?;
    let builder = config.table_builder()?;
    let last_input = inputs.last().ok_or(Error::NoInputs)?;

    // Under the file partition only this rank's own files are inspected.
    let own_files = file_range(inputs.len(), rank, size);
    let counts = inputs
        .iter()
        .enumerate()
        .map(|(i, path)| match config.partition {
            Partition::Files if !own_files.contains(&i) => Ok(0),
            _ => record_count(path, config.layout),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let segments = assign_segments(inputs, &counts, rank, size, config.partition);

    if segments.is_empty() {
        info!(rank, "no input assigned, probing {} for its layout", last_input.display());
        probe_schema(last_input, config)?;
    } else {
        info!(
            rank,
            segments = segments.len(),
            first = %segments[0].path.display(),
            "input assigned"
        );
    }

    let local_count: u64 = segments.iter().map(|s| s.count).sum();
    let local_blocks: u64 = segments
        .iter()
        .map(|s| s.count.div_ceil(BUFFER_LEN as u64))
        .sum();
    let plan = coordinate(ctx.group().as_ref(), local_count, local_blocks)?;
    info!(
        rank,
        offset = plan.local_offset,
        records = plan.local_count,
        total = plan.global_total,
        "output window assigned"
    );

    let storage = if size > 1 && config.collective_io {
        FileStorage::collective(output, Arc::clone(ctx.group()))
    } else {
        FileStorage::new(output)
    };
    let mut pool = ColumnWriterPool::new(
        storage,
        OutputLayout {
            prefix: config.population.clone(),
            total_records: plan.global_total,
            window: plan.window(),
        },
        PoolConfig {
            queue_capacity: config.queue_capacity,
        },
    );

    let monitor = ProgressMonitor::new(plan.global_block_total);
    {
        let mut writer = TouchTableWriter::new(builder, &mut pool);
        writer.prepare()?;

        let mut next_index = plan.local_offset;
        for segment in &segments {
            if segment.count == 0 {
                continue;
            }
            let mut reader = TouchReader::open(&segment.path, config.layout, config.endian_swap)?;
            reader.seek(segment.start)?;
            reader.set_next_index(next_index);

            let mut converter = Converter::new(&mut reader, &mut writer);
            // The root's progress stands in for everyone's.
            if ctx.is_root() {
                converter.set_progress_handler(monitor.handler(), size as u64);
            }
            converter.export_n(segment.count)?;
            debug!(
                rank,
                path = %segment.path.display(),
                start = segment.start,
                count = segment.count,
                "segment converted"
            );
            next_index += segment.count;
        }
    }
    pool.close_files()?;
    let columns = pool.columns().into_iter().map(String::from).collect();
    drop(pool);

    ctx.group().barrier()?;
    if ctx.is_root() {
        info!(records = plan.global_total, "data conversion complete");
    }
    ctx.group().barrier()?;

    let mut index = None;
    if config.create_index {
        if ctx.is_root() {
            info!("creating indices");
            let summary = index::write_indices(output, &config.population, NodeCounts::default())
                .inspect_err(|e| error!(rank, error = %e, "failed to write indices"))?;
            index = Some(summary);
        }
        ctx.group().barrier()?;
    }

    if ctx.is_root() {
        info!(output = %output.display(), population = %config.population, "finished writing");
    }
    Ok(RankReport {
        plan,
        columns,
        index,
    })
}

// ------------------------------------------------------------------------------------------------
// Local multi-rank runs
// ------------------------------------------------------------------------------------------------

/// Aborts the group if the rank's thread unwinds, so its peers stop waiting.
struct AbortOnPanic(Arc<LocalGroup>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// Runs `f` on `ranks` simulated ranks (threads sharing a [`LocalGroup`]).
///
/// Returns every rank's result in rank order, or the root-cause error: a
/// rank's own failure is preferred over peers that merely saw the abort.
pub fn run_local<T, F>(ranks: usize, f: F) -> Result<Vec<T>, Error>
where
    T: Send,
    F: Fn(ExecContext) -> Result<T, Error> + Sync,
{
    if ranks == 0 {
        return Err(Error::InvalidConfig("ranks must be >= 1".into()));
    }
    let members = LocalGroup::create(ranks);
    let control = members[0].clone();

    let results: Vec<Result<T, Error>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(ranks);
        for member in members {
            let rank = member.rank();
            let member = Arc::new(member);
            let f = &f;
            let spawned = thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn_scoped(scope, move || {
                    let _guard = AbortOnPanic(Arc::clone(&member));
                    f(ExecContext::new(member))
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    control.abort();
                    handles.clear();
                    return vec![Err(spawn_error(rank, e))];
                }
            }
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle.join().unwrap_or(Err(Error::RankPanicked(rank))))
            .collect()
    });

    let mut values = Vec::with_capacity(results.len());
    let mut root_cause = None;
    let mut abort = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) if e.is_abort() => {
                abort.get_or_insert(e);
            }
            Err(e) => {
                root_cause.get_or_insert(e);
            }
        }
    }
    match root_cause.or(abort) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

fn spawn_error(rank: usize, source: io::Error) -> Error {
    Error::Io {
        path: PathBuf::from(format!("<rank-{rank} thread>")),
        source,
    }
}

/// Converts `inputs` into `output` with `ranks` ranks.
///
/// A single rank runs on the calling thread; more ranks run as threads of a
/// [`LocalGroup`]. Reports come back in rank order.
pub fn convert(
    inputs: &[PathBuf],
    output: &Path,
    config: &ConvertConfig,
    ranks: usize,
) -> Result<Vec<RankReport>, Error> {
    if ranks == 1 {
        return convert_rank(&ExecContext::solo(), inputs, output, config).map(|r| vec![r]);
    }
    run_local(ranks, |ctx| convert_rank(&ctx, inputs, output, config))
}

/// Touch files under `input`: the file itself, or a directory's files sorted
/// by name.
pub fn list_inputs(input: &Path) -> Result<Vec<PathBuf>, Error> {
    let files = reader::list_inputs(input).map_err(|source| Error::Io {
        path: input.to_path_buf(),
        source,
    })?;
    if files.is_empty() {
        return Err(Error::NoInputs);
    }
    Ok(files)
}
