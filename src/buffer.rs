//! # Bounded Byte Buffers
//!
//! Two fixed-capacity containers sit on the receive and transmit sides of
//! every connection:
//!
//! - [`RingBuffer`] — a byte-oriented circular buffer that keeps the most
//!   recent window of received data. Overflow discards the oldest bytes and
//!   bumps a monotonic drop counter; writers never block and never fail.
//! - [`BoundedQueue`] — a chunk-oriented FIFO for the transmit side. Pushes
//!   are non-blocking and report failure when the queue is full, which is the
//!   backpressure signal producers react to.
//!
//! Both use a short-held `parking_lot` mutex internally, which is sufficient
//! for the single-producer/single-consumer ring and the many-producer/
//! one-consumer transmit queue. Neither is on a per-byte hot path: the ring
//! sees one write per read batch and the queue one operation per chunk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default receive ring capacity (512 KiB).
pub const DEFAULT_RING_CAPACITY: usize = 512 * 1024;

/// Default transmit queue depth in chunks.
pub const DEFAULT_TX_QUEUE_LIMIT: usize = 128;

/// Fixed-capacity circular byte buffer with a drop-oldest overflow policy.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    dropped_total: AtomicU64,
}

#[derive(Debug)]
struct RingInner {
    buf: Vec<u8>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0; capacity],
                head: 0,
                len: 0,
            }),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Append `bytes`, discarding the oldest stored bytes first when free
    /// space is insufficient. Input larger than the whole capacity is
    /// truncated to its trailing `capacity` bytes, counting the truncated
    /// prefix as dropped.
    ///
    /// Returns `(stored, dropped)` for this call.
    pub fn write(&self, bytes: &[u8]) -> (usize, usize) {
        let mut inner = self.inner.lock();
        let capacity = inner.buf.len();
        let mut dropped = 0usize;

        let input = if bytes.len() > capacity {
            dropped += bytes.len() - capacity;
            &bytes[bytes.len() - capacity..]
        } else {
            bytes
        };

        let free = capacity - inner.len;
        if input.len() > free {
            let evict = input.len() - free;
            inner.head = (inner.head + evict) % capacity;
            inner.len -= evict;
            dropped += evict;
        }

        let mut write_at = (inner.head + inner.len) % capacity;
        for &b in input {
            inner.buf[write_at] = b;
            write_at = (write_at + 1) % capacity;
        }
        inner.len += input.len();

        if dropped > 0 {
            self.dropped_total.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        (input.len(), dropped)
    }

    /// Remove and return up to `max` bytes as one contiguous copy.
    pub fn read_chunk(&self, max: usize) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.len);
        let capacity = inner.buf.len();
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            out.push(inner.buf[(inner.head + i) % capacity]);
        }
        inner.head = (inner.head + take) % capacity;
        inner.len -= take;
        out
    }

    /// Number of bytes currently stored.
    pub fn available(&self) -> usize {
        self.inner.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Monotonic count of bytes discarded by overflow since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

/// Thread-safe bounded FIFO of chunks with non-blocking operations.
///
/// `try_push` fails (returns `false`) when the queue is at capacity; it is
/// the caller's backpressure signal and never blocks. `push_front` exists for
/// the single consumer to return the unsent remainder of a partially written
/// chunk; it bypasses the capacity check so a partial write can never lose
/// bytes.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an item; `false` when the queue is full.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            return false;
        }
        inner.push_back(item);
        true
    }

    /// Remove the oldest item, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Re-queue an item at the front (consumer-side remainder of a partial
    /// write). Not bounded: the item was already accounted for when pushed.
    pub fn push_front(&self, item: T) {
        self.inner.lock().push_front(item);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued items, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.len();
        inner.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_stores_and_reads_in_order() {
        let ring = RingBuffer::with_capacity(8);
        assert_eq!(ring.write(b"abc"), (3, 0));
        assert_eq!(ring.write(b"de"), (2, 0));
        assert_eq!(ring.read_chunk(4), b"abcd");
        assert_eq!(ring.read_chunk(4), b"e");
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn ring_drops_oldest_on_overflow() {
        let ring = RingBuffer::with_capacity(4);
        ring.write(b"abcd");
        let (stored, dropped) = ring.write(b"ef");
        assert_eq!((stored, dropped), (2, 2));
        assert_eq!(ring.read_chunk(16), b"cdef");
        assert_eq!(ring.dropped_total(), 2);
    }

    #[test]
    fn ring_truncates_oversized_write_to_capacity() {
        let ring = RingBuffer::with_capacity(4);
        let (stored, dropped) = ring.write(b"0123456789");
        assert_eq!((stored, dropped), (4, 6));
        assert_eq!(ring.read_chunk(16), b"6789");
    }

    #[test]
    fn ring_write_exactly_at_capacity_keeps_everything() {
        // Boundary of overflow: a write equal to the capacity drops nothing
        // when the ring is empty.
        let ring = RingBuffer::with_capacity(4);
        assert_eq!(ring.write(b"wxyz"), (4, 0));
        assert_eq!(ring.dropped_total(), 0);
        assert_eq!(ring.read_chunk(16), b"wxyz");
    }

    #[test]
    fn ring_tail_window_property_holds_for_random_writes() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let capacity = rng.gen_range(1..64);
            let ring = RingBuffer::with_capacity(capacity);
            let mut everything = Vec::new();
            for _ in 0..rng.gen_range(1..10) {
                let chunk: Vec<u8> = (0..rng.gen_range(0..96)).map(|_| rng.gen()).collect();
                ring.write(&chunk);
                everything.extend_from_slice(&chunk);
            }
            let mut read_back = Vec::new();
            loop {
                let chunk = ring.read_chunk(5);
                if chunk.is_empty() {
                    break;
                }
                read_back.extend_from_slice(&chunk);
            }
            let expected_len = everything.len().min(capacity);
            assert_eq!(&read_back, &everything[everything.len() - expected_len..]);
            assert_eq!(
                ring.dropped_total(),
                (everything.len() - expected_len) as u64
            );
        }
    }

    #[test]
    fn queue_rejects_push_at_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(1));
        assert!(queue.try_push(2));
        assert!(!queue.try_push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn queue_pops_in_push_order_with_front_requeue() {
        let queue = BoundedQueue::new(4);
        queue.try_push("a");
        queue.try_push("b");
        assert_eq!(queue.try_pop(), Some("a"));
        queue.push_front("a-rest");
        assert_eq!(queue.try_pop(), Some("a-rest"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn queue_popped_sequence_is_prefix_of_pushed_sequence() {
        let queue = BoundedQueue::new(8);
        let mut accepted = Vec::new();
        for i in 0..20 {
            if queue.try_push(i) {
                accepted.push(i);
            }
            if i % 3 == 0 {
                queue.try_pop();
            }
        }
        let mut popped = Vec::new();
        while let Some(v) = queue.try_pop() {
            popped.push(v);
        }
        // Everything left in the queue is the tail of the accepted sequence.
        assert_eq!(&accepted[accepted.len() - popped.len()..], &popped[..]);
    }

    #[test]
    fn queue_clear_reports_dropped_count() {
        let queue = BoundedQueue::new(4);
        queue.try_push(1);
        queue.try_push(2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
