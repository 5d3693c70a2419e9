//! Growable receive buffer for the threaded transport.
//!
//! Bytes are read into the spare tail and parsed from the front. Before each read,
//! [`ReceiveBuffer::ensure_space`] compacts unparsed bytes to the front and, if the
//! free tail is still below the low-water mark, doubles the buffer up to its cap.
//! Unparsed bytes are never lost by compaction or growth.

use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};

#[derive(Debug)]
pub struct ReceiveBuffer {
    buf: PooledBuffer,
    start: usize,
    end: usize,
    low_water: usize,
    cap: usize,
}

impl ReceiveBuffer {
    pub fn new(pool: &BufferPool, initial: usize, low_water: usize, cap: usize) -> Self {
        let size = initial.min(cap).max(1);
        let mut buf = pool.rent(size);
        buf.resize(size, 0);
        Self {
            buf,
            start: 0,
            end: 0,
            low_water: low_water.max(1),
            cap: cap.max(size),
        }
    }

    /// Make room for the next read.
    ///
    /// Fails only when the buffer is at its cap and completely full, which means the
    /// peer sent a record larger than the cap allows.
    pub fn ensure_space(&mut self) -> Result<()> {
        if self.tail_free() >= self.low_water {
            return Ok(());
        }

        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        if self.tail_free() < self.low_water && self.buf.len() < self.cap {
            let grown = self.buf.len().saturating_mul(2).min(self.cap);
            self.buf.resize(grown, 0);
        }

        if self.tail_free() == 0 {
            return Err(ProtocolError::OversizedMessage(self.end));
        }
        Ok(())
    }

    #[inline]
    fn tail_free(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Writable region after the buffered bytes
    pub fn spare(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    /// Record that `n` bytes were written into [`spare`](Self::spare)
    pub fn advance(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buf.len());
    }

    /// Buffered bytes not yet parsed
    pub fn filled(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Drop `n` parsed bytes from the front
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}
