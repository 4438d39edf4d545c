//! Buffered Touch Reader
//!
//! This module streams fixed-size touch records off a seekable source in
//! blocks of [`BUFFER_LEN`] records, optionally converting the byte order of
//! every 32-bit word as it is loaded.
//!
//! ## Design Overview
//!
//! The reader keeps two positions:
//!
//! - the **cursor**: index of the next record handed out by
//!   [`TouchReader::get_next`] or [`TouchReader::fill_buffer`];
//! - the **stream position**: where the underlying source currently points,
//!   in records. The source is only repositioned when the two disagree.
//!
//! Sequential iteration goes through an internal block-aligned window.
//! [`TouchReader::seek`] moves the cursor and invalidates the window; the
//! next [`TouchReader::get_next`] reloads the block containing the cursor.
//! [`TouchReader::fill_buffer`] is the unbuffered bulk path: records go
//! straight into caller memory and the window is invalidated.
//!
//! # On-disk layout
//!
//! ```text
//! [RECORD_0][RECORD_1]...[RECORD_{n-1}]      (no header, no padding)
//! ```
//!
//! `record_count = file_len / record_size`. Trailing bytes that do not form a
//! whole record are ignored.
//!
//! # Guarantees
//!
//! - **Bounds:** no read ever goes past `record_count`.
//! - **End of stream:** running off the end yields [`ReaderError::EndOfStream`],
//!   distinct from I/O failures.
//! - **Integrity:** a record that cannot be decoded fails the read with its
//!   absolute position.
//! - **Recovery:** a failed read leaves the stream position unknown, so the
//!   next read seeks again. As an [`Iterator`] the reader stops after the
//!   first error until it is repositioned with [`TouchReader::seek`].

#[cfg(test)]
mod tests;

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::converter::BlockReader;
use crate::record::{self, IndexedTouch, LayoutVersion, RecordError, Touch};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Number of records in one block.
pub const BUFFER_LEN: usize = 256;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`TouchReader`].
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Underlying I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Position outside `[0, record_count)`.
    #[error("invalid position {pos} (record count {record_count})")]
    OutOfRange { pos: u64, record_count: u64 },

    /// Iteration reached the last record. Not a failure.
    #[error("end of stream")]
    EndOfStream,

    /// A record could not be decoded.
    #[error("corrupt record {position} in {path}: {source}")]
    Corrupt {
        path: String,
        position: u64,
        #[source]
        source: RecordError,
    },
}

impl ReaderError {
    /// Returns `true` for the normal end-of-iteration signal.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Buffered, endian-aware reader of touch records.
///
/// Generic over the source so tests can read from memory; files are opened
/// through [`TouchReader::open`].
pub struct TouchReader<R = File> {
    source: R,

    /// Display name of the source, used in errors and logs.
    name: String,

    version: LayoutVersion,
    record_count: u64,
    endian_swap: bool,

    /// Records per window: [`BUFFER_LEN`] when buffered, 1 otherwise.
    window_len: usize,

    /// Next record to hand out.
    cursor: u64,

    /// Where `source` currently points, in records.
    stream_pos: u64,

    /// First record held in `window`.
    window_start: u64,

    /// Valid records in `window`; 0 means invalidated.
    window_filled: usize,

    window: Vec<Touch>,

    /// Scratch space for raw record bytes.
    raw: Vec<u8>,

    /// Sequence index given to the next record upgraded by `read_block`.
    next_index: u64,

    /// Set when the iterator yielded an error; cleared by `seek`.
    failed: bool,
}

impl TouchReader<File> {
    /// Opens a touch file.
    ///
    /// # Parameters
    /// - `path`: touch file to read.
    /// - `version`: record layout of the file.
    /// - `endian_swap`: swap every 32-bit word on load.
    pub fn open(
        path: impl AsRef<Path>,
        version: LayoutVersion,
        endian_swap: bool,
    ) -> Result<Self, ReaderError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = File::open(path).map_err(|source| ReaderError::Io {
            path: name.clone(),
            source,
        })?;
        Self::from_source(file, name, version, endian_swap)
    }
}

impl<R: Read + Seek> TouchReader<R> {
    /// Wraps any seekable source.
    pub fn from_source(
        mut source: R,
        name: impl Into<String>,
        version: LayoutVersion,
        endian_swap: bool,
    ) -> Result<Self, ReaderError> {
        let name = name.into();
        let io_err = |source| ReaderError::Io {
            path: name.clone(),
            source,
        };

        let length = source.seek(SeekFrom::End(0)).map_err(io_err)?;
        source.seek(SeekFrom::Start(0)).map_err(io_err)?;

        let record_size = version.record_size() as u64;
        let record_count = length / record_size;
        let trailing = length % record_size;
        if trailing != 0 {
            warn!(
                source = %name,
                trailing,
                record_size,
                "ignoring trailing bytes that do not form a whole record"
            );
        }

        debug!(source = %name, %version, record_count, endian_swap, "opened touch source");

        Ok(Self {
            source,
            name,
            version,
            record_count,
            endian_swap,
            window_len: BUFFER_LEN,
            cursor: 0,
            stream_pos: 0,
            window_start: 0,
            window_filled: 0,
            window: vec![Touch::default(); BUFFER_LEN],
            raw: Vec::new(),
            next_index: 0,
            failed: false,
        })
    }

    /// Switches to single-record windows.
    pub fn unbuffered(mut self) -> Self {
        self.window_len = 1;
        self.window.truncate(1);
        self.window_filled = 0;
        self
    }

    /// Number of whole records in the source.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of [`BUFFER_LEN`]-record blocks, rounding up.
    pub fn block_count(&self) -> u64 {
        self.record_count.div_ceil(BUFFER_LEN as u64)
    }

    /// Index of the next record to be read.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Records left after the cursor.
    pub fn remaining(&self) -> u64 {
        self.record_count - self.cursor
    }

    /// Layout the source is decoded with.
    pub fn layout(&self) -> LayoutVersion {
        self.version
    }

    /// Display name of the source.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the sequence index for the next record upgraded by
    /// [`BlockReader::read_block`].
    pub fn set_next_index(&mut self, index: u64) {
        self.next_index = index;
    }

    /// Positions the reader so that `pos` is the next record returned.
    ///
    /// The window is realigned to the block containing `pos`
    /// (`pos - pos % BUFFER_LEN`) and its cached contents are dropped. An
    /// iterator stopped by an error resumes from here.
    ///
    /// # Errors
    ///
    /// [`ReaderError::OutOfRange`] if `pos >= record_count`.
    pub fn seek(&mut self, pos: u64) -> Result<(), ReaderError> {
        if pos >= self.record_count {
            return Err(ReaderError::OutOfRange {
                pos,
                record_count: self.record_count,
            });
        }
        self.window_start = pos - pos % self.window_len as u64;
        self.window_filled = 0;
        self.cursor = pos;
        self.failed = false;
        trace!(source = %self.name, pos, window_start = self.window_start, "seek");
        Ok(())
    }

    /// Returns the record at the cursor and advances it.
    ///
    /// Reloads the window transparently when the cursor leaves it.
    ///
    /// # Errors
    ///
    /// [`ReaderError::EndOfStream`] once every record has been returned.
    pub fn get_next(&mut self) -> Result<Touch, ReaderError> {
        if self.cursor >= self.record_count {
            return Err(ReaderError::EndOfStream);
        }

        let in_window = self.window_filled > 0
            && self.cursor >= self.window_start
            && self.cursor < self.window_start + self.window_filled as u64;
        if !in_window {
            self.load_window()?;
        }

        let touch = self.window[(self.cursor - self.window_start) as usize];
        self.cursor += 1;
        Ok(touch)
    }

    /// Returns the record at `index`; iteration continues after it.
    pub fn get_item(&mut self, index: u64) -> Result<Touch, ReaderError> {
        self.seek(index)?;
        self.get_next()
    }

    /// Reads up to `n` records at the cursor directly into `buf`.
    ///
    /// The count is clamped to `buf.len()` and to the records remaining.
    /// The cursor advances by the number actually read, which is returned.
    /// The internal window is invalidated.
    pub fn fill_buffer(&mut self, buf: &mut [Touch], n: usize) -> Result<usize, ReaderError> {
        let load_n = (n.min(buf.len()) as u64).min(self.remaining()) as usize;
        self.window_filled = 0;
        if load_n == 0 {
            return Ok(0);
        }

        let start = self.cursor;
        self.load_into(start, &mut buf[..load_n])?;
        self.cursor += load_n as u64;
        Ok(load_n)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn load_window(&mut self) -> Result<(), ReaderError> {
        let start = self.cursor - self.cursor % self.window_len as u64;
        let load_n = (self.window_len as u64).min(self.record_count - start) as usize;

        let mut window = std::mem::take(&mut self.window);
        let result = self.load_into(start, &mut window[..load_n]);
        self.window = window;
        result?;

        self.window_start = start;
        self.window_filled = load_n;
        Ok(())
    }

    /// Reads `out.len()` records starting at record `start`.
    fn load_into(&mut self, start: u64, out: &mut [Touch]) -> Result<(), ReaderError> {
        let record_size = self.version.record_size();
        let io_err = |name: &str, source| ReaderError::Io {
            path: name.to_string(),
            source,
        };

        if self.stream_pos != start {
            self.stream_pos = u64::MAX;
            self.source
                .seek(SeekFrom::Start(start * record_size as u64))
                .map_err(|e| io_err(&self.name, e))?;
            self.stream_pos = start;
        }

        let byte_len = out.len() * record_size;
        self.raw.resize(byte_len, 0);
        if let Err(e) = self.source.read_exact(&mut self.raw[..byte_len]) {
            // A partial read moved the source by an unknown amount.
            self.stream_pos = u64::MAX;
            return Err(io_err(&self.name, e));
        }
        self.stream_pos += out.len() as u64;

        if self.endian_swap {
            record::swap_words(&mut self.raw[..byte_len]);
        }

        record::decode_records(&self.raw[..byte_len], self.version, out).map_err(
            |(i, source)| ReaderError::Corrupt {
                path: self.name.clone(),
                position: start + i as u64,
                source,
            },
        )
    }
}

impl<R: Read + Seek> Iterator for TouchReader<R> {
    type Item = Result<Touch, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.get_next() {
            Err(ReaderError::EndOfStream) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
            ok => Some(ok),
        }
    }
}

impl<R: Read + Seek> BlockReader for TouchReader<R> {
    type Item = IndexedTouch;

    fn record_count(&self) -> u64 {
        self.record_count
    }

    fn position(&self) -> u64 {
        self.cursor
    }

    /// Reads the next block and upgrades every record to an
    /// [`IndexedTouch`] with consecutive sequence indices.
    fn read_block(
        &mut self,
        buf: &mut Vec<IndexedTouch>,
        n: usize,
    ) -> Result<usize, ReaderError> {
        let mut touches = vec![Touch::default(); n.min(self.remaining() as usize)];
        let read = self.fill_buffer(&mut touches, n)?;

        buf.clear();
        buf.extend(
            touches[..read]
                .iter()
                .zip(self.next_index..)
                .map(|(touch, index)| touch.indexed(index)),
        );
        self.next_index += read as u64;
        Ok(read)
    }
}

/// Returns the file path of every touch file under `path`, sorted.
///
/// A file path is returned as-is; for a directory its regular files are
/// listed (hidden files skipped).
pub fn list_inputs(path: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        let hidden = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if entry.file_type()?.is_file() && !hidden {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}
