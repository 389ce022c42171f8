// src/queue.rs
//
// Bounded blocking FIFO used by the asynchronous log sink: producers push
// formatted lines without blocking (a full queue rejects), exactly one
// drainer thread pops.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Append an item. Returns false when the queue is at capacity.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Take the oldest item, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut items = self.items.lock().unwrap();
        loop {
            match items.pop_front() {
                Some(item) => return item,
                None => items = self.not_empty.wait(items).unwrap(),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_is_preserved() {
        let q = BlockingQueue::new(8);
        for i in 0..8 {
            assert!(q.push(i));
        }
        for i in 0..8 {
            assert_eq!(q.pop(), i);
        }
    }

    #[test]
    fn push_rejects_when_full() {
        let q = BlockingQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.pop(), 1);
        assert!(q.push(3));
    }

    #[test]
    fn pop_blocks_until_producer_arrives() {
        let q = Arc::new(BlockingQueue::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop())
        };
        thread::sleep(std::time::Duration::from_millis(10));
        assert!(q.push(42));
        assert_eq!(consumer.join().unwrap(), 42);
    }
}
