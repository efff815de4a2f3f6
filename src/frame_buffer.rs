//! Bounded MPMC queues with drop-oldest discipline.
//!
//! Two independent instances of [`FrameBuffer`] back the pipeline: the
//! transmit side (`FrameBuffer<EncodedPacket>`, capture → network) and the
//! receive side (`FrameBuffer<AudioFrame>`, network → playback). Both share
//! the same push/pop/clear machinery; only the transmit side additionally
//! owns a [`SeqCounter`] to stamp sequence numbers as frames are produced.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::DEFAULT_POP_TIMEOUT;

/// Per-sender monotonic sequence counter, starting at 0.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU32);

impl SeqCounter {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Returns the next sequence number and advances the counter.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A bounded FIFO that never blocks on push: once full, the oldest entry is
/// evicted to make room and the eviction is counted. Internally a mutex +
/// condition variable rather than a
/// lock-free structure: the queue depth is tiny (default 10) and the
/// operations are already on the hot path of a real-time thread, so a short
/// critical section is preferable to the complexity of a lock-free ring.
pub struct FrameBuffer<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FrameBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "FrameBuffer capacity must be positive");
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item`. If the buffer is full, the oldest item is evicted
    /// first and the drop counted. Never blocks, never fails.
    pub fn push(&self, item: T) -> bool {
        let mut queue = self.queue.lock().expect("FrameBuffer mutex poisoned");
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue immediately; `None` if empty.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock().expect("FrameBuffer mutex poisoned");
        let item = queue.pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Dequeue, blocking up to `timeout` for an item to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let queue = self.queue.lock().expect("FrameBuffer mutex poisoned");
        let (mut queue, _timed_out) = self
            .not_empty
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .expect("FrameBuffer mutex poisoned");
        let item = queue.pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Dequeue for playback, blocking up to the default 10 ms wait.
    pub fn pop_playback(&self) -> Option<T> {
        self.pop_timeout(DEFAULT_POP_TIMEOUT)
    }

    pub fn size(&self) -> usize {
        self.queue.lock().expect("FrameBuffer mutex poisoned").len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn popped_count(&self) -> u64 {
        self.popped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.queue.lock().expect("FrameBuffer mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_under_burst() {
        let buf: FrameBuffer<u32> = FrameBuffer::new(4);
        for seq in 0..10u32 {
            buf.push(seq);
        }
        assert_eq!(buf.size(), 4);
        assert_eq!(buf.dropped_count(), 6);
        assert_eq!(buf.pop(), Some(6));
        assert_eq!(buf.pop(), Some(7));
        assert_eq!(buf.pop(), Some(8));
        assert_eq!(buf.pop(), Some(9));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn never_exceeds_capacity_and_balances() {
        let buf: FrameBuffer<u32> = FrameBuffer::new(4);
        let mut expected_size: i64 = 0;
        for seq in 0..37u32 {
            buf.push(seq);
            assert!(buf.size() <= 4);
            if seq % 3 == 0 {
                if buf.pop().is_some() {
                    expected_size -= 1;
                }
            }
        }
        let _ = expected_size;
        assert_eq!(
            buf.pushed_count() as i64 - buf.popped_count() as i64 - buf.dropped_count() as i64,
            buf.size() as i64
        );
    }

    #[test]
    fn pop_timeout_returns_none_on_empty() {
        let buf: FrameBuffer<u32> = FrameBuffer::new(4);
        let start = std::time::Instant::now();
        assert_eq!(buf.pop_timeout(Duration::from_millis(10)), None);
        assert!(start.elapsed() >= Duration::from_millis(8));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        use std::sync::Arc;
        use std::thread;

        let buf: Arc<FrameBuffer<u32>> = Arc::new(FrameBuffer::new(4));
        let producer = buf.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(2));
            producer.push(42);
        });
        assert_eq!(buf.pop_timeout(Duration::from_millis(500)), Some(42));
    }

    #[test]
    fn clear_discards_everything() {
        let buf: FrameBuffer<u32> = FrameBuffer::new(4);
        buf.push(1);
        buf.push(2);
        buf.clear();
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn seq_counter_starts_at_zero_and_is_monotonic() {
        let counter = SeqCounter::new();
        let values: Vec<u32> = (0..5).map(|_| counter.next()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
