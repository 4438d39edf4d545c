//! FIFO order, close/drain, and blocking behaviour.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::queue::{QueueError, ZeroCopyQueue};

    #[test]
    fn fifo_order_across_threads() {
        let queue = Arc::new(ZeroCopyQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.put(vec![i; 3]).unwrap();
                }
                queue.close();
            })
        };

        let mut got = Vec::new();
        while let Some(batch) = queue.get() {
            assert_eq!(batch.len(), 3);
            got.push(batch[0]);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn close_drains_remaining_items_then_ends() {
        let queue = ZeroCopyQueue::new(8);
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), None);
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn put_after_close_returns_the_item() {
        let queue = ZeroCopyQueue::new(2);
        queue.close();
        queue.close();
        let err = queue.put(String::from("batch")).unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
        assert_eq!(err.into_inner(), "batch");
    }

    #[test]
    fn try_get_does_not_block() {
        let queue = ZeroCopyQueue::new(1);
        assert_eq!(queue.try_get(), None::<u8>);
        queue.put(9).unwrap();
        assert_eq!(queue.try_get(), Some(9));
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let queue = ZeroCopyQueue::<u8>::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn full_queue_blocks_until_consumer_takes() {
        let queue = Arc::new(ZeroCopyQueue::new(1));
        queue.put(0u8).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(1))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.get(), Some(0));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.get(), Some(1));
    }

    #[test]
    fn blocked_consumer_wakes_on_close() {
        let queue = Arc::new(ZeroCopyQueue::<u8>::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
