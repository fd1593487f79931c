//! Fixed-capacity blocking FIFO shared by the pipeline stages.
//!
//! The queue has no close operation. Producers signal end of stream by
//! enqueuing [`Message::Sentinel`], and consumers count sentinels.

use crossbeam_channel::{bounded, Receiver, Sender};

/// An item travelling through a [`BoundedQueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Message<T> {
    /// A unit of work or a result.
    Item(T),
    /// "No more items from this producer."
    Sentinel,
}

/// Multi-producer, multi-consumer bounded queue with blocking put/take.
///
/// Clones share the same underlying buffer. Every handle owns both a sender
/// and a receiver, so the channel never disconnects while a handle is alive
/// and neither `put` nor `take` has an error path.
pub struct BoundedQueue<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` messages.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue a message, blocking while the queue is full.
    pub fn put(&self, msg: Message<T>) {
        // Disconnection is impossible: `self.rx` keeps the channel open.
        let _ = self.tx.send(msg);
    }

    /// Enqueue a work item.
    pub fn put_item(&self, item: T) {
        self.put(Message::Item(item));
    }

    /// Enqueue one termination sentinel.
    pub fn put_sentinel(&self) {
        self.put(Message::Sentinel);
    }

    /// Dequeue the oldest message, blocking while the queue is empty.
    pub fn take(&self) -> Message<T> {
        self.rx.recv().unwrap_or(Message::Sentinel)
    }

    /// Number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of buffered messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_single_producer() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.put_item(i);
        }
        q.put_sentinel();

        for i in 0..5 {
            assert_eq!(q.take(), Message::Item(i));
        }
        assert_eq!(q.take(), Message::Sentinel);
        assert!(q.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let q: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.put_item(7);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_put_blocks_until_take() {
        let q = BoundedQueue::new(1);
        let second_put_done = Arc::new(AtomicBool::new(false));

        let producer = {
            let q = q.clone();
            let done = Arc::clone(&second_put_done);
            thread::spawn(move || {
                q.put_item(1u32);
                q.put_item(2u32);
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(
            !second_put_done.load(Ordering::SeqCst),
            "second put must block while the queue is full"
        );

        assert_eq!(q.take(), Message::Item(1));
        producer.join().expect("producer thread");
        assert!(second_put_done.load(Ordering::SeqCst));
        assert_eq!(q.take(), Message::Item(2));
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let q = BoundedQueue::new(4);
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        q.put_item(p * 1000 + i);
                    }
                    q.put_sentinel();
                })
            })
            .collect();

        let mut seen = Vec::new();
        let mut sentinels = 0;
        while sentinels < 4 {
            match q.take() {
                Message::Item(v) => seen.push(v),
                Message::Sentinel => sentinels += 1,
            }
        }
        for p in producers {
            p.join().expect("producer thread");
        }

        assert_eq!(seen.len(), 400);
        // Per-producer order is preserved even though producers interleave.
        for p in 0..4u32 {
            let mine: Vec<u32> = seen.iter().copied().filter(|v| v / 1000 == p).collect();
            let expected: Vec<u32> = (0..100).map(|i| p * 1000 + i).collect();
            assert_eq!(mine, expected);
        }
    }
}
