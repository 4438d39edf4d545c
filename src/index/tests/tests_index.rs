//! Range index construction and the on-disk index layout.

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::coordination::OffsetWindow;
    use crate::index::{EdgeIndex, IndexError, NodeCounts, write_indices};
    use crate::storage::{
        Dataset, DatasetHandle, DatasetSpec, ElementType, FileStorage, StorageBackend,
    };
    use crate::table::ColumnData;

    const NNODES: u64 = 10;
    const SOURCE_OFFSET: u64 = 90;

    fn write_column(root: &Path, name: &str, data: ColumnData) {
        let element = ElementType::from_column_type(data.column_type()).unwrap();
        let rows = data.len() as u64;
        let storage = FileStorage::new(root);
        let mut handle = storage
            .create_dataset(&DatasetSpec::column(name, element, rows, OffsetWindow::full(rows)))
            .unwrap();
        handle.write_at(0, &data).unwrap();
        handle.close().unwrap();
    }

    fn pairs(root: &Path, name: &str) -> Vec<[u64; 2]> {
        match Dataset::open_in(root, name).unwrap().read() {
            ColumnData::UInt64(v) => v.chunks_exact(2).map(|c| [c[0], c[1]]).collect(),
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn runs_are_grouped_by_node_in_edge_order() {
        let index = EdgeIndex::build(&[2, 2, 0, 2, 3, 3], 5);
        assert_eq!(
            index.node_to_ranges,
            [[0, 1], [0, 0], [1, 3], [3, 4], [0, 0]]
        );
        assert_eq!(index.ranges, [[2, 3], [0, 2], [3, 4], [4, 6]]);
    }

    #[test]
    fn empty_input_gives_empty_ranges() {
        let index = EdgeIndex::build(&[], 3);
        assert_eq!(index.node_to_ranges, [[0, 0]; 3]);
        assert!(index.ranges.is_empty());
    }

    /// # Scenario
    /// Every source node connects to every target node.
    ///
    /// # Starting environment
    /// Sources `90..100`, each repeated 10 times; targets `0..10` tiled
    /// 10 times. Source node count 100, target node count 10.
    ///
    /// # Expected behavior
    /// Each source owns one range of 10 edges; each target owns 10
    /// single-edge ranges spaced 10 apart.
    #[test]
    fn full_bipartite_index_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sources: Vec<i64> = (SOURCE_OFFSET..SOURCE_OFFSET + NNODES)
            .flat_map(|s| std::iter::repeat_n(s as i64, NNODES as usize))
            .collect();
        let targets: Vec<i64> = (0..NNODES)
            .flat_map(|_| (0..NNODES).map(|t| t as i64))
            .collect();
        write_column(root, "data/source_node_id", ColumnData::Int64(sources));
        write_column(root, "data/target_node_id", ColumnData::Int64(targets));

        let summary = write_indices(
            root,
            "data",
            NodeCounts {
                source: Some(SOURCE_OFFSET + NNODES),
                target: Some(NNODES),
            },
        )
        .unwrap();
        assert_eq!(summary.edges, NNODES * NNODES);

        let source_ranges = pairs(root, "data/indices/source_to_target/node_id_to_ranges");
        let source_edges = pairs(root, "data/indices/source_to_target/range_to_edge_id");
        let target_ranges = pairs(root, "data/indices/target_to_source/node_id_to_ranges");
        let target_edges = pairs(root, "data/indices/target_to_source/range_to_edge_id");

        assert_eq!(source_ranges.len() as u64, SOURCE_OFFSET + NNODES);
        assert_eq!(target_ranges.len() as u64, NNODES);
        assert_eq!(source_edges.len() as u64, NNODES);
        assert_eq!(target_edges.len() as u64, NNODES * NNODES);

        for range in &source_ranges[..SOURCE_OFFSET as usize] {
            assert_eq!(*range, [0, 0]);
        }
        for i in 0..NNODES {
            assert_eq!(source_ranges[(SOURCE_OFFSET + i) as usize], [i, i + 1]);
            assert_eq!(source_edges[i as usize], [NNODES * i, NNODES * (i + 1)]);
        }
        for i in 0..NNODES {
            assert_eq!(target_ranges[i as usize], [NNODES * i, NNODES * (i + 1)]);
            for j in 0..NNODES {
                assert_eq!(
                    target_edges[(NNODES * i + j) as usize],
                    [NNODES * j + i, NNODES * j + i + 1]
                );
            }
        }
    }

    #[test]
    fn node_counts_default_to_max_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_column(root, "p/source_node_id", ColumnData::Int32(vec![0, 4, 4]));
        write_column(root, "p/target_node_id", ColumnData::Int32(vec![1, 1, 1]));

        let summary = write_indices(root, "p", NodeCounts::default()).unwrap();
        assert_eq!(summary.source_nodes, 5);
        assert_eq!(summary.target_nodes, 2);
        assert_eq!(
            pairs(root, "p/indices/target_to_source/range_to_edge_id"),
            [[0, 3]]
        );
    }

    #[test]
    fn invalid_node_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_column(root, "n/source_node_id", ColumnData::Int32(vec![0, -3]));
        write_column(root, "n/target_node_id", ColumnData::Int32(vec![0, 0]));
        assert!(matches!(
            write_indices(root, "n", NodeCounts::default()),
            Err(IndexError::NegativeNodeId {
                value: -3,
                edge: 1,
                ..
            })
        ));

        write_column(root, "m/source_node_id", ColumnData::UInt32(vec![0, 7]));
        write_column(root, "m/target_node_id", ColumnData::UInt32(vec![0, 0]));
        let counts = NodeCounts {
            source: Some(5),
            target: None,
        };
        assert!(matches!(
            write_indices(root, "m", counts),
            Err(IndexError::NodeOutOfRange {
                value: 7,
                node_count: 5,
                ..
            })
        ));
    }

    #[test]
    fn missing_columns_surface_storage_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            write_indices(dir.path(), "absent", NodeCounts::default()),
            Err(IndexError::Storage(_))
        ));
    }
}
