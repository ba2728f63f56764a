// =============================================================================
// Event Queue — bounded FIFO between the socket reader and the dispatcher
// =============================================================================
//
// Capacity is the overload valve of the whole pipeline: a full queue rejects
// the item instead of growing. Storage is a pre-sized ring so neither end
// shifts memory.
// =============================================================================

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{FeedError, Result};

/// Default capacity of both the transport queue and per-subscriber queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Mutex-guarded bounded FIFO.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append `item` at the tail. Fails with `QueueOverflow` at capacity.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(FeedError::QueueOverflow);
        }
        items.push_back(item);
        Ok(())
    }

    /// Pop the head. Fails with `QueueUnderflow` when empty.
    pub fn dequeue(&self) -> Result<T> {
        self.items.lock().pop_front().ok_or(FeedError::QueueUnderflow)
    }

    /// Remove everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn overflow_at_capacity() {
        let queue = EventQueue::new(3);
        for i in 0..3 {
            queue.enqueue(i).unwrap();
        }
        assert!(queue.is_full());
        assert!(matches!(queue.enqueue(3), Err(FeedError::QueueOverflow)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn underflow_when_empty() {
        let queue: EventQueue<u8> = EventQueue::new(2);
        assert!(matches!(queue.dequeue(), Err(FeedError::QueueUnderflow)));
        queue.enqueue(1).unwrap();
        queue.dequeue().unwrap();
        assert!(matches!(queue.dequeue(), Err(FeedError::QueueUnderflow)));
    }

    #[test]
    fn interleaved_calls_keep_fifo_order() {
        let queue = EventQueue::new(4);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();
        assert_eq!(queue.dequeue().unwrap(), "a");
        queue.enqueue("c").unwrap();
        queue.enqueue("d").unwrap();
        queue.enqueue("e").unwrap();
        let rest: Vec<_> = std::iter::from_fn(|| queue.dequeue().ok()).collect();
        assert_eq!(rest, vec!["b", "c", "d", "e"]);
    }

    #[test]
    fn overflow_recovers_after_dequeue() {
        let queue = EventQueue::new(1);
        queue.enqueue(1).unwrap();
        assert!(queue.enqueue(2).is_err());
        assert_eq!(queue.dequeue().unwrap(), 1);
        queue.enqueue(2).unwrap();
        assert_eq!(queue.drain(), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn producer_and_consumer_threads_preserve_order() {
        let queue = Arc::new(EventQueue::new(16));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut next = 0u32;
                while next < 1_000 {
                    if queue.enqueue(next).is_ok() {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut seen = Vec::with_capacity(1_000);
        while seen.len() < 1_000 {
            match queue.dequeue() {
                Ok(v) => seen.push(v),
                Err(_) => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(seen.windows(2).all(|w| w[0] + 1 == w[1]));
    }
}
