//! Per-column concurrent writer.
//!
//! A [`ColumnWriterPool`] fans each incoming [`Table`] out to one storage
//! thread per column. Every column owns a bounded [`ZeroCopyQueue`] and a
//! dataset handle; its thread pulls batches off the queue and writes them at
//! increasing offsets inside the process's window. Columns progress
//! independently; within a column, write order is arrival order.
//!
//! ## Lifecycle
//!
//! 1. [`ColumnWriterPool::prepare`] validates every column type, then creates
//!    one dataset per column in schema order and starts its thread. All
//!    processes prepare the same schema, which keeps collective dataset
//!    creation in step.
//! 2. [`ColumnWriterPool::write_table`] queues one batch per column.
//! 3. [`ColumnWriterPool::close_files`] closes every queue, joins every
//!    thread, and checks that each column filled its whole window. It runs
//!    from `Drop` as well, ignoring errors there.
//!
//! A column thread that fails stops consuming; the next `write_table` for
//! that column reports the storage error as [`WriterError::Worker`].

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::converter::BlockWriter;
use crate::coordination::OffsetWindow;
use crate::queue::ZeroCopyQueue;
use crate::record::IndexedTouch;
use crate::storage::{DatasetHandle, DatasetSpec, ElementType, StorageBackend, StorageError};
use crate::table::{ColumnData, ColumnType, Schema, Table, TouchTableBuilder};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`ColumnWriterPool`].
#[derive(Debug, Error)]
pub enum WriterError {
    /// A column type has no storage element type.
    #[error("column '{column}' has unmapped type {column_type:?}")]
    UnmappedType {
        column: String,
        column_type: ColumnType,
    },

    /// A table carries a column the pool was not prepared with.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A table's schema differs from the prepared one.
    #[error("table schema does not match the prepared schema")]
    SchemaChanged,

    /// Batches of one table differ in length.
    #[error("column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// A column ended with fewer rows than this process's window holds.
    #[error("column '{column}': wrote {written} of {window_len} window rows")]
    WindowIncomplete {
        column: String,
        window_len: u64,
        written: u64,
    },

    /// More rows than this process's window holds.
    #[error("column '{column}': {attempted} rows exceed window of {window_len}")]
    WindowOverflow {
        column: String,
        window_len: u64,
        attempted: u64,
    },

    /// A column thread failed while writing.
    #[error("column '{column}' writer failed: {source}")]
    Worker {
        column: String,
        #[source]
        source: StorageError,
    },

    /// A column thread panicked.
    #[error("column '{0}' writer panicked")]
    WorkerPanicked(String),

    /// A column thread could not be started.
    #[error("failed to spawn column writer: {0}")]
    Spawn(#[from] io::Error),

    /// The pool has been closed.
    #[error("writer pool is closed")]
    Closed,

    /// Dataset creation failed.
    #[error("{0}")]
    Storage(#[from] StorageError),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning knobs of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Batches buffered per column before the producer blocks.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

/// Where this process's rows go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    /// Dataset name prefix (the population), datasets are `prefix/column`.
    pub prefix: String,

    /// Global row count of every dataset.
    pub total_records: u64,

    /// Rows this process writes.
    pub window: OffsetWindow,
}

// ------------------------------------------------------------------------------------------------
// Pool
// ------------------------------------------------------------------------------------------------

/// Rows written by a column thread, or why it stopped.
type WorkerResult = Result<u64, StorageError>;

struct ColumnWorker {
    name: String,
    queue: Arc<ZeroCopyQueue<ColumnData>>,
    thread: Option<JoinHandle<WorkerResult>>,

    /// Rows handed to the queue so far.
    queued_rows: u64,

    /// Set once the thread has been joined successfully.
    rows_written: Option<u64>,
}

impl ColumnWorker {
    /// Joins the thread, returning its outcome. `None` if already joined.
    fn join(&mut self) -> Option<Result<u64, WriterError>> {
        let thread = self.thread.take()?;
        let outcome = match thread.join() {
            Ok(Ok(rows)) => {
                self.rows_written = Some(rows);
                Ok(rows)
            }
            Ok(Err(source)) => Err(WriterError::Worker {
                column: self.name.clone(),
                source,
            }),
            Err(_) => Err(WriterError::WorkerPanicked(self.name.clone())),
        };
        Some(outcome)
    }
}

/// One storage thread per column.
pub struct ColumnWriterPool<S: StorageBackend> {
    storage: S,
    layout: OutputLayout,
    config: PoolConfig,
    schema: Option<Schema>,
    workers: Vec<ColumnWorker>,
    closed: bool,
}

impl<S: StorageBackend> std::fmt::Debug for ColumnWriterPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnWriterPool")
            .field("layout", &self.layout)
            .field("columns", &self.workers.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend> ColumnWriterPool<S> {
    pub fn new(storage: S, layout: OutputLayout, config: PoolConfig) -> Self {
        Self {
            storage,
            layout,
            config,
            schema: None,
            workers: Vec::new(),
            closed: false,
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Creates one dataset and thread per column of `schema`.
    ///
    /// Every type is checked before anything is created. Preparing the same
    /// schema again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`WriterError::UnmappedType`] if a column type cannot be stored.
    /// - [`WriterError::SchemaChanged`] if prepared with a different schema.
    pub fn prepare(&mut self, schema: &Schema) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        if let Some(prepared) = &self.schema {
            return if prepared == schema {
                Ok(())
            } else {
                Err(WriterError::SchemaChanged)
            };
        }

        let elements = schema
            .fields
            .iter()
            .map(|field| {
                ElementType::from_column_type(field.column_type).map_err(|_| {
                    WriterError::UnmappedType {
                        column: field.name.clone(),
                        column_type: field.column_type,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.schema = Some(schema.clone());
        for (field, element) in schema.fields.iter().zip(elements) {
            self.spawn_column(&field.name, element)?;
        }

        info!(
            columns = self.workers.len(),
            total_records = self.layout.total_records,
            window_offset = self.layout.window.offset,
            window_len = self.layout.window.len,
            "column writers started"
        );
        Ok(())
    }

    /// Queues one batch per column of `table`.
    ///
    /// Prepares the pool from the table's schema on first use. Nothing is
    /// queued unless the whole table is accepted.
    ///
    /// # Errors
    ///
    /// - [`WriterError::LengthMismatch`] if batches differ in length.
    /// - [`WriterError::UnknownColumn`] for a column the pool does not write.
    /// - [`WriterError::SchemaChanged`] if the table's columns, their order or
    ///   their types differ from the prepared schema.
    /// - [`WriterError::WindowOverflow`] if a column would exceed its window.
    pub fn write_table(&mut self, table: Table) -> Result<(), WriterError> {
        if self.closed {
            return Err(WriterError::Closed);
        }
        if self.schema.is_none() {
            self.prepare(&table.schema())?;
        }

        let rows = table.num_rows();
        let mut targets = Vec::with_capacity(table.columns.len());
        for batch in &table.columns {
            if batch.data.len() != rows {
                return Err(WriterError::LengthMismatch {
                    column: batch.name.clone(),
                    expected: rows,
                    actual: batch.data.len(),
                });
            }
            let idx = self
                .workers
                .iter()
                .position(|w| w.name == batch.name)
                .ok_or_else(|| WriterError::UnknownColumn(batch.name.clone()))?;
            let attempted = self.workers[idx].queued_rows + rows as u64;
            if attempted > self.layout.window.len {
                return Err(WriterError::WindowOverflow {
                    column: batch.name.clone(),
                    window_len: self.layout.window.len,
                    attempted,
                });
            }
            targets.push(idx);
        }
        if !self.matches_schema(&table) {
            return Err(WriterError::SchemaChanged);
        }

        for (batch, idx) in table.columns.into_iter().zip(targets) {
            let worker = &mut self.workers[idx];
            if worker.queue.put(batch.data).is_err() {
                return Err(Self::failure(worker));
            }
            worker.queued_rows += rows as u64;
        }
        Ok(())
    }

    /// Closes every queue and joins every column thread.
    ///
    /// Returns the first failure. Without one, every column must have written
    /// exactly its window, else [`WriterError::WindowIncomplete`]. Calling it
    /// again is a no-op.
    pub fn close_files(&mut self) -> Result<(), WriterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for worker in &self.workers {
            worker.queue.close();
        }

        let mut first_error = None;
        for worker in &mut self.workers {
            if let Some(Err(e)) = worker.join() {
                error!(column = %worker.name, error = %e, "column writer failed");
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() {
            first_error = self.short_column();
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(columns = self.workers.len(), "column writers closed");
                Ok(())
            }
        }
    }

    /// Column names in schema order.
    pub fn columns(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Rows a column thread wrote, once it has been joined.
    pub fn rows_written(&self, column: &str) -> Option<u64> {
        self.workers
            .iter()
            .find(|w| w.name == column)
            .and_then(|w| w.rows_written)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn spawn_column(&mut self, column: &str, element: ElementType) -> Result<(), WriterError> {
        let spec = DatasetSpec::column(
            format!("{}/{column}", self.layout.prefix),
            element,
            self.layout.total_records,
            self.layout.window,
        );
        let handle = self.storage.create_dataset(&spec)?;

        let queue = Arc::new(ZeroCopyQueue::new(self.config.queue_capacity));
        let worker_queue = Arc::clone(&queue);
        let start = self.layout.window.offset;
        let thread = thread::Builder::new()
            .name(format!("column-{column}"))
            .spawn(move || run_column(handle, &worker_queue, start))?;

        debug!(column, dataset = %spec.name, ?element, "column writer spawned");
        self.workers.push(ColumnWorker {
            name: column.to_string(),
            queue,
            thread: Some(thread),
            queued_rows: 0,
            rows_written: None,
        });
        Ok(())
    }

    fn matches_schema(&self, table: &Table) -> bool {
        let Some(schema) = &self.schema else {
            return false;
        };
        schema.fields.len() == table.columns.len()
            && schema.fields.iter().zip(&table.columns).all(|(field, batch)| {
                field.name == batch.name && field.column_type == batch.data.column_type()
            })
    }

    /// The first column whose rows do not cover the window.
    fn short_column(&self) -> Option<WriterError> {
        let window_len = self.layout.window.len;
        let worker = self
            .workers
            .iter()
            .find(|w| w.rows_written.unwrap_or(0) != window_len)?;
        let written = worker.rows_written.unwrap_or(0);
        error!(column = %worker.name, written, window_len, "column window left incomplete");
        Some(WriterError::WindowIncomplete {
            column: worker.name.clone(),
            window_len,
            written,
        })
    }

    /// Turns a rejected `put` into the column thread's error.
    fn failure(worker: &mut ColumnWorker) -> WriterError {
        match worker.join() {
            Some(Err(e)) => e,
            _ => WriterError::Closed,
        }
    }
}

impl<S: StorageBackend> Drop for ColumnWriterPool<S> {
    fn drop(&mut self) {
        let _ = self.close_files();
    }
}

/// Column thread body: write every batch at the cursor until the queue ends.
fn run_column<H: DatasetHandle>(
    mut handle: H,
    queue: &ZeroCopyQueue<ColumnData>,
    start: u64,
) -> WorkerResult {
    let mut cursor = start;
    while let Some(batch) = queue.get() {
        if let Err(e) = handle.write_at(cursor, &batch) {
            error!(dataset = handle.name(), offset = cursor, error = %e, "column write failed");
            // Refuse further batches and release a producer blocked on a full queue.
            queue.close();
            while queue.get().is_some() {}
            return Err(e);
        }
        cursor += batch.len() as u64;
    }
    handle.close()?;
    Ok(cursor - start)
}

// ------------------------------------------------------------------------------------------------
// Touch table writer
// ------------------------------------------------------------------------------------------------

/// Table-construction step: turns blocks of records into tables and hands
/// them to the pool.
pub struct TouchTableWriter<'p, S: StorageBackend> {
    builder: TouchTableBuilder,
    pool: &'p mut ColumnWriterPool<S>,
}

impl<'p, S: StorageBackend> TouchTableWriter<'p, S> {
    pub fn new(builder: TouchTableBuilder, pool: &'p mut ColumnWriterPool<S>) -> Self {
        Self { builder, pool }
    }

    /// Prepares the pool with this writer's schema.
    pub fn prepare(&mut self) -> Result<(), WriterError> {
        self.pool.prepare(&self.builder.schema())
    }
}

impl<S: StorageBackend> BlockWriter<IndexedTouch> for TouchTableWriter<'_, S> {
    fn write(&mut self, data: &[IndexedTouch]) -> Result<(), WriterError> {
        self.pool.write_table(self.builder.build(data))
    }
}
