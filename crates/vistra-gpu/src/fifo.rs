//! Bounded, thread-safe FIFO queue.
//!
//! The only synchronization primitive shared between transfer producers and
//! the transfer consumer: one mutex guarding a fixed-capacity ring, plus
//! two condvars for the "not full" and "not empty" edges.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// Fixed-capacity blocking FIFO.
pub struct Fifo<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Fifo<T> {
    /// Create a queue bounded at `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "FIFO capacity must be at least 1");
        tracing::trace!(capacity, "creating FIFO queue");
        Self {
            ring: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Maximum number of items the queue holds.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.ring.lock().items.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().items.is_empty()
    }

    /// Append an item, blocking while the queue is full.
    pub fn enqueue(&self, item: T) {
        let mut ring = self.ring.lock();
        while ring.items.len() == ring.capacity {
            tracing::trace!("FIFO full, waiting for a dequeue");
            self.not_full.wait(&mut ring);
        }
        ring.items.push_back(item);
        self.not_empty.notify_one();
    }

    /// Append an item without blocking. Returns the item back on a full
    /// queue.
    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), T> {
        let mut ring = self.ring.lock();
        if ring.items.len() == ring.capacity {
            return Err(item);
        }
        ring.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest item.
    ///
    /// With `blocking`, waits until an item is available. Otherwise returns
    /// `None` immediately on an empty queue.
    pub fn dequeue(&self, blocking: bool) -> Option<T> {
        let mut ring = self.ring.lock();
        if blocking {
            while ring.items.is_empty() {
                self.not_empty.wait(&mut ring);
            }
        }
        let item = ring.items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Drop the oldest items so that at most `max` remain.
    pub fn discard(&self, max: usize) {
        let mut ring = self.ring.lock();
        let len = ring.items.len();
        if len > max {
            tracing::trace!(dropped = len - max, "discarding items from overloaded FIFO");
            ring.items.drain(..len - max);
            self.not_full.notify_all();
        }
    }

    /// Drop every queued item.
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.items.clear();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn preserves_order_across_threads() {
        const N: usize = 1000;
        let fifo = Fifo::new(4);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..N {
                    fifo.enqueue(i);
                }
            });

            for expected in 0..N {
                assert_eq!(fifo.dequeue(true), Some(expected));
            }
        });

        assert!(fifo.is_empty());
    }

    #[test]
    fn capacity_one_still_ordered() {
        let fifo = Fifo::new(1);
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100 {
                    fifo.enqueue(i);
                }
            });
            for expected in 0..100 {
                assert_eq!(fifo.dequeue(true), Some(expected));
            }
        });
    }

    #[test]
    fn enqueue_blocks_when_full() {
        let fifo = Fifo::new(8);
        for i in 0..8 {
            fifo.enqueue(i);
        }
        assert_eq!(fifo.len(), 8);

        let ninth_done = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                fifo.enqueue(8);
                ninth_done.store(true, Ordering::SeqCst);
            });

            // The ninth enqueue must still be parked on the full queue.
            std::thread::sleep(Duration::from_millis(50));
            assert!(!ninth_done.load(Ordering::SeqCst));

            assert_eq!(fifo.dequeue(true), Some(0));

            // One slot freed; the blocked producer completes.
            while !ninth_done.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        assert_eq!(fifo.len(), 8);
    }

    #[test]
    fn try_enqueue_rejects_when_full() {
        let fifo = Fifo::new(2);
        assert!(fifo.try_enqueue(1).is_ok());
        assert!(fifo.try_enqueue(2).is_ok());
        assert_eq!(fifo.try_enqueue(3), Err(3));
    }

    #[test]
    fn non_blocking_dequeue_on_empty() {
        let fifo: Fifo<u32> = Fifo::new(4);
        assert_eq!(fifo.dequeue(false), None);
    }

    #[test]
    fn discard_keeps_newest() {
        let fifo = Fifo::new(8);
        for i in 0..6 {
            fifo.enqueue(i);
        }
        fifo.discard(2);
        assert_eq!(fifo.len(), 2);
        assert_eq!(fifo.dequeue(false), Some(4));
        assert_eq!(fifo.dequeue(false), Some(5));
    }

    #[test]
    fn reset_clears_queue() {
        let fifo = Fifo::new(4);
        fifo.enqueue(1);
        fifo.enqueue(2);
        fifo.reset();
        assert!(fifo.is_empty());
        assert_eq!(fifo.dequeue(false), None);
    }
}
