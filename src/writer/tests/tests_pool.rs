//! Happy-path column fan-out through file storage.

#[cfg(test)]
mod tests {
    use crate::converter::{BlockWriter, Converter};
    use crate::coordination::OffsetWindow;
    use crate::reader::TouchReader;
    use crate::record::{LayoutVersion, Touch};
    use crate::storage::{Dataset, FileStorage};
    use crate::table::{ColumnBatch, ColumnData, ColumnType, Field, Schema, Table, TouchTableBuilder};
    use crate::writer::{ColumnWriterPool, OutputLayout, PoolConfig, TouchTableWriter};

    fn layout(total: u64, window: OffsetWindow) -> OutputLayout {
        OutputLayout {
            prefix: "pop".into(),
            total_records: total,
            window,
        }
    }

    fn table(a: Vec<i32>, b: Vec<f64>) -> Table {
        Table {
            columns: vec![
                ColumnBatch {
                    name: "a".into(),
                    data: ColumnData::Int32(a),
                },
                ColumnBatch {
                    name: "b".into(),
                    data: ColumnData::Float64(b),
                },
            ],
        }
    }

    #[test]
    fn tables_land_in_their_window() {
        let dir = tempfile::tempdir().unwrap();
        let window = OffsetWindow { offset: 2, len: 5 };
        let mut pool = ColumnWriterPool::new(
            FileStorage::new(dir.path()),
            layout(10, window),
            PoolConfig { queue_capacity: 1 },
        );

        pool.write_table(table(vec![1, 2], vec![0.5, 1.5])).unwrap();
        pool.write_table(table(vec![3, 4, 5], vec![2.5, 3.5, 4.5]))
            .unwrap();
        pool.close_files().unwrap();

        assert_eq!(pool.columns(), ["a", "b"]);
        assert_eq!(pool.rows_written("a"), Some(5));
        assert_eq!(pool.rows_written("b"), Some(5));
        assert_eq!(pool.rows_written("c"), None);

        let a = Dataset::open_in(dir.path(), "pop/a").unwrap();
        assert_eq!(a.read(), ColumnData::Int32(vec![0, 0, 1, 2, 3, 4, 5, 0, 0, 0]));
        let b = Dataset::open_in(dir.path(), "pop/b").unwrap();
        assert_eq!(
            b.read_rows(2, 5),
            ColumnData::Float64(vec![0.5, 1.5, 2.5, 3.5, 4.5])
        );
    }

    #[test]
    fn prepare_creates_datasets_before_any_data() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::new(vec![
            Field::new("x", ColumnType::UInt16),
            Field::new("y", ColumnType::Int8),
        ]);
        let mut pool = ColumnWriterPool::new(
            FileStorage::new(dir.path()),
            layout(0, OffsetWindow::full(0)),
            PoolConfig::default(),
        );
        pool.prepare(&schema).unwrap();
        pool.prepare(&schema).unwrap();
        pool.close_files().unwrap();

        for name in ["pop/x", "pop/y"] {
            let dataset = Dataset::open_in(dir.path(), name).unwrap();
            assert!(dataset.is_empty());
        }
        assert_eq!(pool.rows_written("x"), Some(0));
    }

    #[test]
    fn close_is_idempotent_and_blocks_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = ColumnWriterPool::new(
            FileStorage::new(dir.path()),
            layout(1, OffsetWindow::full(1)),
            PoolConfig::default(),
        );
        pool.write_table(table(vec![1], vec![1.0])).unwrap();
        pool.close_files().unwrap();
        pool.close_files().unwrap();
        assert!(matches!(
            pool.write_table(table(vec![2], vec![2.0])),
            Err(crate::writer::WriterError::Closed)
        ));
    }

    #[test]
    fn drop_closes_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut pool = ColumnWriterPool::new(
                FileStorage::new(dir.path()),
                layout(1, OffsetWindow::full(1)),
                PoolConfig::default(),
            );
            pool.write_table(table(vec![9], vec![9.0])).unwrap();
        }
        let a = Dataset::open_in(dir.path(), "pop/a").unwrap();
        assert_eq!(a.read(), ColumnData::Int32(vec![9]));
    }

    #[test]
    fn touch_table_writer_converts_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let version = LayoutVersion::V1;
        let bytes: Vec<u8> = (0..300)
            .flat_map(|i| {
                Touch {
                    version,
                    pre_ids: [i, 0, 0],
                    post_ids: [i % 7, 0, 0],
                    ..Touch::default()
                }
                .to_bytes(version)
            })
            .collect();
        let mut reader =
            TouchReader::from_source(std::io::Cursor::new(bytes), "mem", version, false).unwrap();

        let builder =
            TouchTableBuilder::with_projection(version, &["source_node_id", "synapse_index"])
                .unwrap();
        let mut pool = ColumnWriterPool::new(
            FileStorage::new(dir.path()),
            layout(300, OffsetWindow::full(300)),
            PoolConfig::default(),
        );
        {
            let mut writer = TouchTableWriter::new(builder, &mut pool);
            writer.prepare().unwrap();
            writer.write(&[]).unwrap();
            Converter::new(&mut reader, &mut writer).export_all().unwrap();
        }
        pool.close_files().unwrap();

        assert_eq!(pool.columns(), ["source_node_id", "synapse_index"]);
        let ids = Dataset::open_in(dir.path(), "pop/source_node_id").unwrap();
        assert_eq!(ids.read(), ColumnData::Int32((0..300).collect()));
        let index = Dataset::open_in(dir.path(), "pop/synapse_index").unwrap();
        assert_eq!(index.read(), ColumnData::Int64((0..300).collect()));
    }
}
