//! Per-session output buffering. Every session starts on a small inline
//! buffer; a burst that outgrows it switches the session to a large buffer
//! borrowed from a shared free list, and a burst that outgrows even that is
//! clipped with a visible overflow marker. Large buffers go back on the
//! free list at flush so steady-state traffic allocates nothing.

pub const OVERFLOW_MARKER: &[u8] = b"**OVERFLOW**\r\n";

/// Free list of large buffers plus usage counters for the stats report.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    large_size: usize,
    pub allocated: u64,
    pub reused: u64,
    pub overflows: u64,
}

impl BufferPool {
    pub fn new(large_size: usize) -> Self {
        Self {
            free: Vec::new(),
            large_size,
            allocated: 0,
            reused: 0,
            overflows: 0,
        }
    }

    fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(buf) => {
                self.reused += 1;
                buf
            }
            None => {
                self.allocated += 1;
                Vec::with_capacity(self.large_size)
            }
        }
    }

    fn put(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        self.free.push(buf);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Two-tier output buffer owned by one session.
pub struct OutputBuffer {
    small: Vec<u8>,
    small_cap: usize,
    large: Option<Vec<u8>>,
    overflowed: bool,
}

impl OutputBuffer {
    pub fn new(small_cap: usize) -> Self {
        Self {
            small: Vec::with_capacity(small_cap),
            small_cap,
            large: None,
            overflowed: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.small.is_empty() && self.large.as_ref().map_or(true, |l| l.is_empty())
    }

    /// Append bytes, promoting to a pooled large buffer on demand. Once the
    /// large buffer is full the remainder of this and later writes is
    /// dropped until the next flush; the overflow is counted once.
    pub fn write(&mut self, pool: &mut BufferPool, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.large.is_none() {
            let room = self.small_cap - self.small.len();
            if bytes.len() <= room {
                self.small.extend_from_slice(bytes);
                return;
            }
            let mut large = pool.take();
            large.extend_from_slice(&self.small);
            self.small.clear();
            self.large = Some(large);
        }
        if let Some(large) = self.large.as_mut() {
            let room = pool.large_size.saturating_sub(large.len());
            if bytes.len() <= room {
                large.extend_from_slice(bytes);
            } else {
                large.extend_from_slice(&bytes[..room]);
                self.overflowed = true;
                pool.overflows += 1;
            }
        }
    }

    /// Bytes buffered since the last flush, without draining them.
    pub fn pending(&self) -> &[u8] {
        match &self.large {
            Some(large) => large,
            None => &self.small,
        }
    }

    /// Drain everything buffered since the last flush into `dst`, returning
    /// any large buffer to the pool. Appends the overflow marker when writes
    /// were clipped. Returns true when anything was flushed.
    pub fn flush_into(&mut self, pool: &mut BufferPool, dst: &mut Vec<u8>) -> bool {
        if self.is_empty() && !self.overflowed {
            return false;
        }
        match self.large.take() {
            Some(large) => {
                dst.extend_from_slice(&large);
                pool.put(large);
            }
            None => {
                dst.extend_from_slice(&self.small);
                self.small.clear();
            }
        }
        if self.overflowed {
            dst.extend_from_slice(OVERFLOW_MARKER);
            self.overflowed = false;
        }
        true
    }

    /// Return any held large buffer to the pool. Called when the session
    /// closes so buffers never leak with their session.
    pub fn release(&mut self, pool: &mut BufferPool) {
        if let Some(large) = self.large.take() {
            pool.put(large);
        }
        self.small.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(out: &mut OutputBuffer, pool: &mut BufferPool) -> Option<Vec<u8>> {
        let mut dst = Vec::new();
        out.flush_into(pool, &mut dst).then_some(dst)
    }

    #[test]
    fn small_writes_stay_inline() {
        let mut pool = BufferPool::new(64);
        let mut out = OutputBuffer::new(16);
        out.write(&mut pool, b"hello ");
        out.write(&mut pool, b"world");
        assert_eq!(pool.allocated, 0);
        assert_eq!(drain(&mut out, &mut pool).unwrap(), b"hello world");
        assert!(drain(&mut out, &mut pool).is_none());
    }

    #[test]
    fn promotes_to_large_preserving_order() {
        let mut pool = BufferPool::new(64);
        let mut out = OutputBuffer::new(8);
        out.write(&mut pool, b"abcdef");
        out.write(&mut pool, b"ghijkl");
        assert_eq!(pool.allocated, 1);
        assert_eq!(drain(&mut out, &mut pool).unwrap(), b"abcdefghijkl");
        // Flush returned the large buffer to the free list.
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn reuses_pooled_buffers() {
        let mut pool = BufferPool::new(64);
        let mut a = OutputBuffer::new(4);
        a.write(&mut pool, b"0123456789");
        drain(&mut a, &mut pool);
        let mut b = OutputBuffer::new(4);
        b.write(&mut pool, b"9876543210");
        assert_eq!(pool.allocated, 1);
        assert_eq!(pool.reused, 1);
    }

    #[test]
    fn clips_on_overflow_and_marks_once() {
        let mut pool = BufferPool::new(10);
        let mut out = OutputBuffer::new(4);
        out.write(&mut pool, b"0123456789ABCDEF");
        out.write(&mut pool, b"more");
        assert_eq!(pool.overflows, 1);
        let flushed = drain(&mut out, &mut pool).unwrap();
        assert_eq!(flushed.len(), 10 + OVERFLOW_MARKER.len());
        assert!(flushed.ends_with(OVERFLOW_MARKER));
        // The buffer is usable again after the flush.
        out.write(&mut pool, b"ok");
        assert_eq!(drain(&mut out, &mut pool).unwrap(), b"ok");
    }

    #[test]
    fn release_returns_large_buffer() {
        let mut pool = BufferPool::new(32);
        let mut out = OutputBuffer::new(4);
        out.write(&mut pool, b"a long enough burst");
        out.release(&mut pool);
        assert_eq!(pool.idle(), 1);
        assert!(out.is_empty());
    }
}
