//! Growable byte buffer (spec.md §4.9): a named `reserve`/`commit`/`consume` contract backed by
//! `bytes::BytesMut`, with adaptive chunk doubling up to a 16 KiB cap.

use bytes::{Buf, BufMut, BytesMut};

const MIN_CHUNK: usize = 2048;
const MAX_CHUNK: usize = 16 * 1024;

/// A buffer that exposes the named `reserve`/`append`/`consume` contract instead of raw
/// `BytesMut` methods, and tracks an adaptive "I/O chunk size" for reads: it doubles, up to
/// `MAX_CHUNK`, whenever the previous read filled the whole reservation.
pub struct GrowBuffer {
    inner: BytesMut,
    next_chunk: usize,
}

impl GrowBuffer {
    pub fn new() -> Self {
        Self { inner: BytesMut::new(), next_chunk: MIN_CHUNK }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.inner
    }

    /// Ensures at least the current adaptive chunk size of spare capacity. Returns the amount
    /// reserved, so a later call to `note_read` can tell whether the read filled it completely.
    pub fn reserve_for_read(&mut self) -> usize {
        self.inner.reserve(self.next_chunk);
        self.next_chunk
    }

    /// Call after a read of `n` bytes into a reservation of `reserved` bytes. Doubles the
    /// adaptive chunk size when the reservation was filled.
    pub fn note_read(&mut self, n: usize, reserved: usize) {
        if n >= reserved && self.next_chunk < MAX_CHUNK {
            self.next_chunk = (self.next_chunk * 2).min(MAX_CHUNK);
        }
    }

    /// Appends bytes directly, growing the buffer as needed. Callers implementing the zero-copy
    /// write fast path of spec.md §4.9 (buffer empty -> try a direct non-blocking send first)
    /// should only reach for this once that direct send left a remainder.
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.reserve(bytes.len());
        self.inner.put_slice(bytes);
    }

    /// Shifts the tail forward by `n` bytes, discarding the consumed prefix.
    pub fn consume(&mut self, n: usize) {
        self.inner.advance(n);
    }

    pub fn as_bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.inner
    }
}

impl Default for GrowBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume_round_trip() {
        let mut buf = GrowBuffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.data(), b"hello world");
        buf.consume(6);
        assert_eq!(buf.data(), b"world");
    }

    #[test]
    fn chunk_size_doubles_when_a_read_fills_the_reservation() {
        let mut buf = GrowBuffer::new();
        let reserved = buf.reserve_for_read();
        assert_eq!(reserved, MIN_CHUNK);
        buf.note_read(reserved, reserved);

        assert_eq!(buf.reserve_for_read(), MIN_CHUNK * 2);
    }

    #[test]
    fn chunk_size_caps_at_max() {
        let mut buf = GrowBuffer::new();
        for _ in 0..10 {
            let reserved = buf.reserve_for_read();
            buf.note_read(reserved, reserved);
        }
        assert_eq!(buf.reserve_for_read(), MAX_CHUNK);
    }

    #[test]
    fn chunk_size_does_not_grow_on_a_partial_read() {
        let mut buf = GrowBuffer::new();
        let reserved = buf.reserve_for_read();
        buf.note_read(reserved / 2, reserved);
        assert_eq!(buf.reserve_for_read(), MIN_CHUNK);
    }
}
