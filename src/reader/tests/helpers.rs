use std::io::Cursor;

use crate::reader::TouchReader;
use crate::record::{LayoutVersion, Touch};

/// Record `i` carries `i` in its pre neuron id and `i * 10` in its post id.
pub fn touch(i: usize, version: LayoutVersion) -> Touch {
    Touch {
        version,
        pre_ids: [i as i32, 1, 2],
        post_ids: [(i * 10) as i32, 3, 4],
        branch: 7,
        distance_soma: i as f32,
        ..Touch::default()
    }
}

pub fn encode(n: usize, version: LayoutVersion) -> Vec<u8> {
    (0..n).flat_map(|i| touch(i, version).to_bytes(version)).collect()
}

pub fn mem_reader(n: usize, version: LayoutVersion) -> TouchReader<Cursor<Vec<u8>>> {
    TouchReader::from_source(Cursor::new(encode(n, version)), "mem", version, false).unwrap()
}
