//! Byte buffers for session I/O.
//!
//! [`DynamicBuffer`] is a growable byte buffer with a formatted-append
//! operation; growth doubles the capacity while it is at or below 512 bytes
//! and switches to exact sizing beyond that. Buffers are recycled through a
//! shared [`BufferPool`] so steady-state traffic does not allocate.
//! [`DynamicQueue`] is the per-session FIFO of outgoing buffers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const DOUBLING_LIMIT: usize = 512;

/// Growable byte buffer with formatted append.
#[derive(Debug, Default)]
pub struct DynamicBuffer {
    data: Vec<u8>,
}

impl DynamicBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Sets the logical size to `count` zero bytes, growing if needed.
    ///
    /// Download payloads are synthetic; zero fill keeps them deterministic.
    pub fn fill(&mut self, count: usize) {
        self.data.clear();
        self.ensure(count);
        self.data.resize(count, 0);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.ensure(self.data.len() + bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Appends formatted text, returning the number of bytes written.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> usize {
        let before = self.data.len();
        // Writing into memory cannot fail.
        let _ = fmt::Write::write_fmt(self, args);
        self.data.len() - before
    }

    /// Grows capacity to hold `required` bytes: double while at or below
    /// [`DOUBLING_LIMIT`], exact beyond it.
    fn ensure(&mut self, required: usize) {
        let capacity = self.data.capacity();
        if required <= capacity {
            return;
        }
        let target = if capacity <= DOUBLING_LIMIT && required < capacity * 2 {
            capacity * 2
        } else {
            required
        };
        self.data.reserve_exact(target - self.data.len());
    }
}

impl fmt::Write for DynamicBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Unbounded LIFO pool of [`DynamicBuffer`] values.
///
/// Buffers move by value, so this pool carries the same total/in-flight
/// accounting as the shared-handle pool but no forced-recovery hook; an
/// idle buffer has nothing to wind down.
#[derive(Default)]
pub struct BufferPool {
    idle: Mutex<Vec<DynamicBuffer>>,
    total: AtomicUsize,
    in_flight: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a buffer with at least `capacity` bytes reserved.
    pub fn borrow(&self, capacity: usize) -> DynamicBuffer {
        let recycled = self.idle.lock().unwrap().pop();
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        match recycled {
            Some(mut buf) => {
                buf.ensure(capacity);
                buf
            }
            None => {
                self.total.fetch_add(1, Ordering::Relaxed);
                DynamicBuffer::with_capacity(capacity)
            }
        }
    }

    pub fn put_back(&self, mut buf: DynamicBuffer) {
        buf.clear();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.idle.lock().unwrap().push(buf);
    }

    pub fn size(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// FIFO of outgoing buffers backed by a shared [`BufferPool`].
pub struct DynamicQueue {
    queue: VecDeque<DynamicBuffer>,
    pool: Arc<BufferPool>,
}

impl DynamicQueue {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            queue: VecDeque::new(),
            pool,
        }
    }

    /// Borrows a free buffer of at least `n` bytes from the buffer pool.
    /// The buffer is eventually either pushed or returned via [`free`].
    ///
    /// [`free`]: DynamicQueue::free
    pub fn prepare(&self, n: usize) -> DynamicBuffer {
        self.pool.borrow(n)
    }

    pub fn free(&self, buf: DynamicBuffer) {
        self.pool.put_back(buf);
    }

    pub fn push(&mut self, buf: DynamicBuffer) {
        self.queue.push_back(buf);
    }

    pub fn front(&self) -> Option<&DynamicBuffer> {
        self.queue.front()
    }

    pub fn pop(&mut self) -> Option<DynamicBuffer> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops all queued buffers back into the pool.
    pub fn clear(&mut self) {
        while let Some(buf) = self.queue.pop_front() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_fmt_writes_text() {
        let mut buf = DynamicBuffer::with_capacity(16);
        let n = buf.append_fmt(format_args!("HTTP/1.1 {} {}\r\n", 200, "OK"));
        assert_eq!(buf.data(), b"HTTP/1.1 200 OK\r\n");
        assert_eq!(n, 17);
    }

    #[test]
    fn test_growth_doubles_below_limit() {
        let mut buf = DynamicBuffer::with_capacity(64);
        buf.fill(60);
        // 70 fits within double of 64, so capacity jumps to 128.
        buf.extend_from_slice(&[0u8; 10]);
        assert!(buf.capacity() >= 128);
        assert_eq!(buf.len(), 70);
    }

    #[test]
    fn test_growth_exact_above_limit() {
        let mut buf = DynamicBuffer::with_capacity(1024);
        buf.fill(1024);
        buf.extend_from_slice(&[1u8; 100]);
        assert!(buf.capacity() >= 1124);
        assert_eq!(buf.len(), 1124);
    }

    #[test]
    fn test_fill_is_zeroed() {
        let mut buf = DynamicBuffer::with_capacity(4);
        buf.extend_from_slice(b"abcd");
        buf.fill(8);
        assert_eq!(buf.data(), &[0u8; 8]);
    }

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = BufferPool::new();
        let buf = pool.borrow(256);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.in_flight(), 1);

        pool.put_back(buf);
        assert_eq!(pool.in_flight(), 0);

        let again = pool.borrow(16);
        // Recycled, not recreated.
        assert_eq!(pool.size(), 1);
        assert!(again.capacity() >= 256);
    }

    #[test]
    fn test_queue_is_fifo() {
        let pool = Arc::new(BufferPool::new());
        let mut queue = DynamicQueue::new(pool);

        let mut a = queue.prepare(8);
        a.extend_from_slice(b"first");
        let mut b = queue.prepare(8);
        b.extend_from_slice(b"second");

        queue.push(a);
        queue.push(b);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().data(), b"first");
        assert_eq!(queue.pop().unwrap().data(), b"second");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_clear_returns_buffers() {
        let pool = Arc::new(BufferPool::new());
        let mut queue = DynamicQueue::new(pool.clone());
        queue.push(queue.prepare(8));
        queue.push(queue.prepare(8));
        assert_eq!(pool.in_flight(), 2);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(pool.in_flight(), 0);
    }
}
