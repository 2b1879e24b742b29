//! Fixed-capacity circular byte buffer with scatter/gather views.
//!
//! The buffer exposes its unread and free regions as at most two contiguous
//! slices, sized for direct use with vectored socket I/O
//! (`IoSlice`/`IoSliceMut`): ask for a view, hand the segments to
//! `read_vectored`/`write_vectored`, then commit exactly the byte count the
//! kernel reported. No intermediate linear copy is ever needed.
//!
//! The buffer itself never errors; exhaustion shows up as empty views and the
//! caller decides what an empty read or a full buffer means for its protocol.

/// Circular byte store with a read cursor, a write cursor and a `full` flag
/// disambiguating the `rp == wp` case.
pub struct RingBuffer {
    buf: Box<[u8]>,
    rp: usize,
    wp: usize,
    full: bool,
}

impl RingBuffer {
    /// Creates a buffer of fixed capacity `len`.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "ring buffer capacity must be non-zero");
        Self {
            buf: vec![0u8; len].into_boxed_slice(),
            rp: 0,
            wp: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        if self.full {
            self.buf.len()
        } else if self.wp >= self.rp {
            self.wp - self.rp
        } else {
            self.buf.len() - self.rp + self.wp
        }
    }

    /// Free space in bytes.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp && !self.full
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Unread bytes as up to two contiguous segments, in reading order. The
    /// second segment is non-empty only when the unread region wraps past the
    /// physical end of the store. Both are empty when the buffer is empty.
    pub fn reading_view(&self) -> (&[u8], &[u8]) {
        if self.is_empty() {
            (&[], &[])
        } else if self.rp < self.wp {
            (&self.buf[self.rp..self.wp], &[])
        } else {
            let (head, tail) = self.buf.split_at(self.rp);
            (tail, &head[..self.wp])
        }
    }

    /// Commits `n` bytes as consumed, advancing the read cursor. A zero `n`
    /// is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unread length the last view reported.
    pub fn read_finish(&mut self, n: usize) {
        assert!(n <= self.len(), "read commit past unread length");
        if n > 0 {
            self.rp = (self.rp + n) % self.buf.len();
            self.full = false;
        }
    }

    /// Free space as up to two contiguous segments, in writing order. The
    /// second segment is non-empty only when the free region wraps past the
    /// physical end of the store. Both are empty when the buffer is full.
    pub fn writing_view(&mut self) -> (&mut [u8], &mut [u8]) {
        if self.full {
            (&mut [], &mut [])
        } else if self.wp < self.rp {
            (&mut self.buf[self.wp..self.rp], &mut [])
        } else {
            let rp = self.rp;
            let (head, tail) = self.buf.split_at_mut(self.wp);
            (tail, &mut head[..rp])
        }
    }

    /// Commits `n` bytes as written, advancing the write cursor. A zero `n`
    /// is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the free space the last view reported.
    pub fn write_finish(&mut self, n: usize) {
        assert!(n <= self.free(), "write commit past free space");
        if n > 0 {
            self.wp = (self.wp + n) % self.buf.len();
            if self.wp == self.rp {
                self.full = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(view: (&[u8], &[u8])) -> usize {
        [view.0, view.1].iter().filter(|s| !s.is_empty()).count()
    }

    fn push(ring: &mut RingBuffer, data: &[u8]) {
        let (a, b) = ring.writing_view();
        let head = data.len().min(a.len());
        a[..head].copy_from_slice(&data[..head]);
        b[..data.len() - head].copy_from_slice(&data[head..]);
        ring.write_finish(data.len());
    }

    fn pop(ring: &mut RingBuffer, n: usize) -> Vec<u8> {
        let (a, b) = ring.reading_view();
        let mut out: Vec<u8> = a.iter().chain(b.iter()).take(n).copied().collect();
        out.truncate(n);
        ring.read_finish(out.len());
        out
    }

    #[test]
    fn empty_views_have_no_segments() {
        let mut ring = RingBuffer::new(8);
        assert!(ring.is_empty());
        assert_eq!(segments(ring.reading_view()), 0);
        let (a, b) = ring.writing_view();
        assert_eq!(a.len() + b.len(), 8);
    }

    #[test]
    fn fifo_round_trip() {
        let mut ring = RingBuffer::new(16);
        push(&mut ring, b"hello");
        push(&mut ring, b" world");
        assert_eq!(ring.len(), 11);
        assert_eq!(pop(&mut ring, 11), b"hello world");
        assert!(ring.is_empty());
    }

    #[test]
    fn fill_then_drain() {
        let mut ring = RingBuffer::new(4);
        push(&mut ring, b"abcd");
        assert!(ring.is_full());
        let (a, b) = ring.writing_view();
        assert!(a.is_empty() && b.is_empty());
        assert_eq!(pop(&mut ring, 4), b"abcd");
        assert!(ring.is_empty());
        assert!(!ring.is_full());
    }

    #[test]
    fn wraparound_yields_two_segments() {
        let mut ring = RingBuffer::new(8);
        push(&mut ring, b"abcdef");
        assert_eq!(pop(&mut ring, 4), b"abcd");
        // rp = 4, wp = 6; a 5-byte write must wrap.
        push(&mut ring, b"ghijk");
        let (a, b) = ring.reading_view();
        assert_eq!(segments((a, b)), 2);
        assert_eq!(a.len() + b.len(), ring.len());
        assert_eq!(pop(&mut ring, 7), b"efghijk");
    }

    #[test]
    fn contiguous_run_yields_one_segment() {
        let mut ring = RingBuffer::new(8);
        push(&mut ring, b"abc");
        assert_eq!(segments(ring.reading_view()), 1);
    }

    #[test]
    fn wrapped_free_region_has_two_segments() {
        let mut ring = RingBuffer::new(8);
        push(&mut ring, b"abcdef");
        pop(&mut ring, 4);
        let (a, b) = ring.writing_view();
        assert!(!a.is_empty() && !b.is_empty());
        assert_eq!(a.len() + b.len(), 6);
    }

    #[test]
    fn zero_commit_is_a_noop() {
        let mut ring = RingBuffer::new(4);
        push(&mut ring, b"ab");
        ring.read_finish(0);
        ring.write_finish(0);
        assert_eq!(ring.len(), 2);
        assert_eq!(pop(&mut ring, 2), b"ab");
    }

    #[test]
    fn full_buffer_reads_back_in_order_across_wrap() {
        let mut ring = RingBuffer::new(6);
        push(&mut ring, b"abcd");
        pop(&mut ring, 4);
        push(&mut ring, b"123456");
        assert!(ring.is_full());
        assert_eq!(pop(&mut ring, 6), b"123456");
    }

    #[test]
    #[should_panic(expected = "read commit past unread length")]
    fn overcommitted_read_panics() {
        let mut ring = RingBuffer::new(4);
        push(&mut ring, b"ab");
        ring.read_finish(3);
    }

    #[test]
    #[should_panic(expected = "write commit past free space")]
    fn overcommitted_write_panics() {
        let mut ring = RingBuffer::new(4);
        push(&mut ring, b"abc");
        ring.write_finish(2);
    }
}
