//! File-backed datasets: header, windows, read-back, and corruption.

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::coordination::OffsetWindow;
    use crate::storage::{
        DATA_ALIGN, Dataset, DatasetHandle, DatasetSpec, ElementType, FileStorage,
        StorageBackend, StorageError,
    };
    use crate::table::{ColumnData, ColumnType};

    fn spec(name: &str, element: ElementType, length: u64) -> DatasetSpec {
        DatasetSpec::column(name, element, length, OffsetWindow::full(length))
    }

    #[test]
    fn element_mapping_is_total_for_fixed_width_types() {
        for (ty, width) in [
            (ColumnType::Int8, 1),
            (ColumnType::UInt16, 2),
            (ColumnType::Float32, 4),
            (ColumnType::Int64, 8),
            (ColumnType::Float64, 8),
        ] {
            let element = ElementType::from_column_type(ty).unwrap();
            assert_eq!(element.width(), width);
            assert_eq!(element.column_type(), ty);
            assert_eq!(ElementType::from_tag(element.tag()), Some(element));
        }
        assert!(matches!(
            ElementType::from_column_type(ColumnType::Utf8),
            Err(StorageError::UnmappedType(ColumnType::Utf8))
        ));
        assert!(ElementType::from_column_type(ColumnType::Boolean).is_err());
        assert_eq!(ElementType::from_tag(200), None);
    }

    #[test]
    fn written_rows_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        let mut handle = storage
            .create_dataset(&spec("pop/distance_soma", ElementType::F32, 5))
            .unwrap();
        assert_eq!(handle.name(), "pop/distance_soma");
        handle
            .write_at(0, &ColumnData::Float32(vec![1.0, 2.0]))
            .unwrap();
        handle
            .write_at(2, &ColumnData::Float32(vec![3.0, 4.0, 5.0]))
            .unwrap();
        handle.close().unwrap();

        let path = storage.dataset_path("pop/distance_soma");
        assert!(path.ends_with("pop/distance_soma.ds"));

        let dataset = Dataset::open(&path).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.header().element, ElementType::F32);
        assert_eq!(
            dataset.read(),
            ColumnData::Float32(vec![1.0, 2.0, 3.0, 4.0, 5.0])
        );
        assert_eq!(
            dataset.read_rows(3, 10),
            ColumnData::Float32(vec![4.0, 5.0])
        );

        let file_len = fs::metadata(&path).unwrap().len();
        assert_eq!(file_len % DATA_ALIGN, 20 % DATA_ALIGN);
    }

    #[test]
    fn unwritten_rows_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage
            .create_dataset(&spec("ids", ElementType::I32, 3))
            .unwrap()
            .close()
            .unwrap();
        let dataset = Dataset::open_in(dir.path(), "ids").unwrap();
        assert_eq!(dataset.read(), ColumnData::Int32(vec![0, 0, 0]));
    }

    #[test]
    fn two_column_rows() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let spec = DatasetSpec {
            row_width: 2,
            ..spec("ranges", ElementType::U64, 3)
        };
        let mut handle = storage.create_dataset(&spec).unwrap();
        handle
            .write_at(1, &ColumnData::UInt64(vec![10, 20, 30, 40]))
            .unwrap();
        let err = handle
            .write_at(0, &ColumnData::UInt64(vec![1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, StorageError::RowWidth { values: 3, .. }));
        handle.close().unwrap();

        let dataset = Dataset::open_in(dir.path(), "ranges").unwrap();
        assert_eq!(dataset.read(), ColumnData::UInt64(vec![0, 0, 10, 20, 30, 40]));
        assert_eq!(dataset.read_rows(2, 1), ColumnData::UInt64(vec![30, 40]));
    }

    #[test]
    fn writes_outside_window_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let spec = DatasetSpec::column(
            "w",
            ElementType::I64,
            100,
            OffsetWindow { offset: 10, len: 5 },
        );
        let mut handle = storage.create_dataset(&spec).unwrap();

        handle.write_at(10, &ColumnData::Int64(vec![1; 5])).unwrap();
        for (offset, rows) in [(9, 1), (14, 2), (15, 1)] {
            let err = handle
                .write_at(offset, &ColumnData::Int64(vec![0; rows]))
                .unwrap_err();
            assert!(matches!(err, StorageError::OutsideWindow { .. }), "{err}");
        }
    }

    #[test]
    fn type_mismatch_and_unmapped_data_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let mut handle = storage
            .create_dataset(&spec("t", ElementType::I32, 4))
            .unwrap();
        assert!(matches!(
            handle.write_at(0, &ColumnData::Float32(vec![1.0])),
            Err(StorageError::TypeMismatch { .. })
        ));
        assert!(matches!(
            handle.write_at(0, &ColumnData::Utf8(vec!["x".into()])),
            Err(StorageError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for bad in [
            spec("", ElementType::U8, 1),
            spec("a//b", ElementType::U8, 1),
            spec("../escape", ElementType::U8, 1),
            DatasetSpec {
                row_width: 0,
                ..spec("zero", ElementType::U8, 1)
            },
            DatasetSpec::column("long", ElementType::U8, 1, OffsetWindow::full(2)),
        ] {
            assert!(matches!(
                storage.create_dataset(&bad),
                Err(StorageError::InvalidSpec { .. })
            ));
        }
    }

    #[test]
    fn corrupted_header_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage
            .create_dataset(&spec("c", ElementType::U32, 2))
            .unwrap()
            .close()
            .unwrap();
        let path = storage.dataset_path("c");

        // Flip a bit in the length field.
        let mut bytes = fs::read(&path).unwrap();
        bytes[13] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Dataset::open(&path),
            Err(StorageError::ChecksumMismatch { .. })
        ));

        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            Dataset::open(&path),
            Err(StorageError::BadMagic { .. })
        ));
    }

    #[test]
    fn truncated_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage
            .create_dataset(&spec("t", ElementType::F64, 10))
            .unwrap()
            .close()
            .unwrap();
        let path = storage.dataset_path("t");
        let len = fs::metadata(&path).unwrap().len();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 8)
            .unwrap();
        assert!(matches!(
            Dataset::open(&path),
            Err(StorageError::Truncated { .. })
        ));
    }

    #[test]
    fn recreating_a_dataset_keeps_header_valid() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for _ in 0..2 {
            let mut handle = storage
                .create_dataset(&spec("again", ElementType::U8, 4))
                .unwrap();
            handle.write_at(0, &ColumnData::UInt8(vec![1, 2, 3, 4])).unwrap();
            handle.close().unwrap();
        }
        let dataset = Dataset::open_in(dir.path(), "again").unwrap();
        assert_eq!(dataset.read(), ColumnData::UInt8(vec![1, 2, 3, 4]));
    }
}
