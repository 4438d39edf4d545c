//! Progress events, the monitor, and buffer count estimates.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::converter::{
        BUFFER_LEN, BlockReader, BlockWriter, Converter, ProgressEvent, ProgressMonitor,
        number_of_buffers,
    };
    use crate::reader::ReaderError;
    use crate::writer::WriterError;

    struct Zeros {
        count: u64,
        pos: u64,
    }

    impl BlockReader for Zeros {
        type Item = u8;

        fn record_count(&self) -> u64 {
            self.count
        }

        fn position(&self) -> u64 {
            self.pos
        }

        fn read_block(&mut self, buf: &mut Vec<u8>, n: usize) -> Result<usize, ReaderError> {
            let read = (n as u64).min(self.count - self.pos) as usize;
            buf.clear();
            buf.resize(read, 0);
            self.pos += read as u64;
            Ok(read)
        }
    }

    struct Sink;

    impl BlockWriter<u8> for Sink {
        fn write(&mut self, _data: &[u8]) -> Result<(), WriterError> {
            Ok(())
        }
    }

    #[test]
    fn handler_is_called_once_per_block() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);

        let mut reader = Zeros { count: 1000, pos: 0 };
        let mut writer = Sink;
        let mut converter = Converter::new(&mut reader, &mut writer);
        converter.set_progress_handler(
            Box::new(move |e: ProgressEvent| sink_events.lock().unwrap().push(e)),
            4,
        );
        converter.export_all().unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].records, BUFFER_LEN);
        assert_eq!(events[3].records, 1000 - 3 * BUFFER_LEN);
        assert_eq!(events[3].blocks_done, 4);
        assert!(events.iter().all(|e| e.scale == 4));
    }

    #[test]
    fn zero_scale_is_treated_as_one() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let mut reader = Zeros { count: 1, pos: 0 };
        let mut writer = Sink;
        let mut converter = Converter::new(&mut reader, &mut writer);
        converter.set_progress_handler(
            Box::new(move |e: ProgressEvent| sink_events.lock().unwrap().push(e.scale)),
            0,
        );
        converter.export_all().unwrap();
        assert_eq!(*events.lock().unwrap(), [1]);
    }

    #[test]
    fn monitor_aggregates_scaled_blocks() {
        let monitor = ProgressMonitor::new(8);
        let mut reader = Zeros {
            count: 2 * BUFFER_LEN as u64,
            pos: 0,
        };
        let mut writer = Sink;
        {
            let mut converter = Converter::new(&mut reader, &mut writer);
            converter.set_progress_handler(monitor.handler(), 4);
            converter.export_all().unwrap();
        }
        assert_eq!(monitor.blocks_done(), 8);
        assert_eq!(monitor.percent(), 100);
    }

    #[test]
    fn monitor_percent_is_clamped() {
        let monitor = ProgressMonitor::new(3);
        assert_eq!(monitor.percent(), 0);
        for _ in 0..5 {
            monitor.record(ProgressEvent {
                records: 1,
                blocks_done: 1,
                scale: 1,
            });
        }
        assert_eq!(monitor.percent(), 100);
        assert_eq!(ProgressMonitor::new(0).percent(), 100);
    }

    #[test]
    fn number_of_buffers_rounds_up() {
        assert_eq!(number_of_buffers(0, 40), 0);
        assert_eq!(number_of_buffers(40, 40), 1);
        assert_eq!(number_of_buffers(40 * 256, 40), 1);
        assert_eq!(number_of_buffers(40 * 257, 40), 2);
        // Partial trailing record does not count.
        assert_eq!(number_of_buffers(40 * 256 + 39, 40), 1);
        assert_eq!(number_of_buffers(100, 0), 0);
    }
}
