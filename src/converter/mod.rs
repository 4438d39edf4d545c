//! Block-at-a-time conversion driver.
//!
//! A [`Converter`] pulls blocks of up to [`BUFFER_LEN`] records from a
//! [`BlockReader`] and pushes them into a [`BlockWriter`] until the reader is
//! exhausted ([`Converter::export_all`]) or a record budget is met
//! ([`Converter::export_n`]). An optional progress handler is called once per
//! block.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, info};

pub use crate::reader::BUFFER_LEN;
use crate::reader::ReaderError;
use crate::writer::WriterError;

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Source of fixed-size records consumed block by block.
pub trait BlockReader {
    /// Record type handed to the writer.
    type Item;

    /// Total number of records in the source.
    fn record_count(&self) -> u64;

    /// Number of [`BUFFER_LEN`]-record blocks, rounding up.
    fn block_count(&self) -> u64 {
        self.record_count().div_ceil(BUFFER_LEN as u64)
    }

    /// Index of the next record to be read.
    fn position(&self) -> u64;

    /// Replaces the contents of `buf` with up to `n` records.
    ///
    /// Returns the number read; `0` means the source is exhausted.
    fn read_block(&mut self, buf: &mut Vec<Self::Item>, n: usize) -> Result<usize, ReaderError>;
}

/// Sink accepting blocks of records.
pub trait BlockWriter<T> {
    /// Consumes one block.
    fn write(&mut self, data: &[T]) -> Result<(), WriterError>;
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Converter`].
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Reading a block failed.
    #[error("read failed: {0}")]
    Read(#[from] ReaderError),

    /// Writing a block failed.
    #[error("write failed: {0}")]
    Write(#[from] WriterError),

    /// The reader ran dry before the requested number of records.
    #[error("reader exhausted after {exported} of {requested} records")]
    Exhausted { requested: u64, exported: u64 },
}

// ------------------------------------------------------------------------------------------------
// Progress
// ------------------------------------------------------------------------------------------------

/// Progress notification sent once per converted block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Records in the block just written.
    pub records: usize,

    /// Blocks written so far by this converter.
    pub blocks_done: u64,

    /// Factor an aggregator multiplies by to estimate global progress
    /// (the process count when only one process reports).
    pub scale: u64,
}

/// Callback invoked once per block.
pub type ProgressHandler<'a> = Box<dyn FnMut(ProgressEvent) + Send + 'a>;

/// Aggregates block progress and logs every `step_percent`.
///
/// Shared between converters by reference; counting is lock-free.
#[derive(Debug)]
pub struct ProgressMonitor {
    total_blocks: u64,
    done: AtomicU64,
    last_logged: AtomicU64,
    step_percent: u64,
}

impl ProgressMonitor {
    /// Creates a monitor expecting `total_blocks` blocks.
    pub fn new(total_blocks: u64) -> Self {
        Self {
            total_blocks,
            done: AtomicU64::new(0),
            last_logged: AtomicU64::new(0),
            step_percent: 10,
        }
    }

    /// Records a converted block.
    pub fn record(&self, event: ProgressEvent) {
        let done = self.done.fetch_add(event.scale, Ordering::Relaxed) + event.scale;
        let percent = self.percent_of(done);
        let bucket = percent / self.step_percent * self.step_percent;
        let last = self.last_logged.fetch_max(bucket, Ordering::Relaxed);
        if bucket > last {
            info!(percent = bucket, blocks = done, total = self.total_blocks, "conversion progress");
        }
    }

    /// Returns a handler feeding this monitor.
    pub fn handler(&self) -> ProgressHandler<'_> {
        Box::new(move |event| self.record(event))
    }

    /// Blocks recorded so far (scaled).
    pub fn blocks_done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Estimated completion, clamped to 100.
    pub fn percent(&self) -> u64 {
        self.percent_of(self.blocks_done())
    }

    fn percent_of(&self, done: u64) -> u64 {
        if self.total_blocks == 0 {
            return 100;
        }
        (done.saturating_mul(100) / self.total_blocks).min(100)
    }
}

// ------------------------------------------------------------------------------------------------
// Converter
// ------------------------------------------------------------------------------------------------

/// Moves records from a [`BlockReader`] to a [`BlockWriter`].
pub struct Converter<'a, R: BlockReader, W: BlockWriter<R::Item>> {
    reader: &'a mut R,
    writer: &'a mut W,
    buffer: Vec<R::Item>,
    progress: Option<ProgressHandler<'a>>,
    progress_scale: u64,
    blocks_done: u64,
}

impl<'a, R: BlockReader, W: BlockWriter<R::Item>> Converter<'a, R, W> {
    pub fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Self {
            reader,
            writer,
            buffer: Vec::with_capacity(BUFFER_LEN),
            progress: None,
            progress_scale: 1,
            blocks_done: 0,
        }
    }

    /// Registers a handler called once per block with the given scale.
    pub fn set_progress_handler(&mut self, handler: ProgressHandler<'a>, scale: u64) {
        self.progress = Some(handler);
        self.progress_scale = scale.max(1);
    }

    /// Converts every remaining record. Returns the number exported.
    pub fn export_all(&mut self) -> Result<u64, ConvertError> {
        let mut exported = 0u64;
        loop {
            let n = self.step(BUFFER_LEN)?;
            if n == 0 {
                break;
            }
            exported += n as u64;
        }
        debug!(exported, blocks = self.blocks_done, "export_all finished");
        Ok(exported)
    }

    /// Converts exactly `n` records, leaving the reader at `position + n`.
    ///
    /// # Errors
    ///
    /// [`ConvertError::Exhausted`] if fewer than `n` records remain; the
    /// records read up to that point have already been written.
    pub fn export_n(&mut self, n: u64) -> Result<u64, ConvertError> {
        let mut exported = 0u64;
        while exported < n {
            let want = (n - exported).min(BUFFER_LEN as u64) as usize;
            let got = self.step(want)?;
            if got == 0 {
                return Err(ConvertError::Exhausted {
                    requested: n,
                    exported,
                });
            }
            exported += got as u64;
        }
        debug!(exported, blocks = self.blocks_done, "export_n finished");
        Ok(exported)
    }

    /// Blocks converted so far.
    pub fn blocks_done(&self) -> u64 {
        self.blocks_done
    }

    fn step(&mut self, want: usize) -> Result<usize, ConvertError> {
        let n = self.reader.read_block(&mut self.buffer, want)?;
        if n == 0 {
            return Ok(0);
        }
        self.writer.write(&self.buffer[..n])?;
        self.blocks_done += 1;

        if let Some(progress) = self.progress.as_mut() {
            progress(ProgressEvent {
                records: n,
                blocks_done: self.blocks_done,
                scale: self.progress_scale,
            });
        }
        Ok(n)
    }
}

/// Expected number of blocks for a raw byte length.
///
/// Used to size progress estimates before a file is opened.
pub fn number_of_buffers(byte_size: u64, record_size: usize) -> u64 {
    if record_size == 0 {
        return 0;
    }
    (byte_size / record_size as u64).div_ceil(BUFFER_LEN as u64)
}
