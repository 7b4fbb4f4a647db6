//! Per-connection read buffer and pending-write queue.
//!
//! The read side is a single fixed-capacity region: the socket fills its
//! unused tail and the read callback drains it from the front. The write side
//! is a FIFO of independently owned chunks waiting for the socket to become
//! writable; a partially sent head chunk is advanced in place, so bytes never
//! reorder within or across chunks.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes};

/// Read buffer size used when neither the embedder nor the config picks one.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Read Buffer
// ============================================================================

/// Fixed-capacity receive buffer.
///
/// `used` bytes at the front hold received data that the read callback has
/// not consumed yet. The buffer never grows: when it is full and nobody
/// drains it, the connection is closed with
/// [`ConnectionError::BufferFull`](crate::ConnectionError::BufferFull).
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    data: Vec<u8>,
    used: usize,
}

impl ReadBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            used: 0,
        }
    }

    /// Wraps embedder-supplied storage. The vector's length is the capacity.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, used: 0 }
    }

    /// Total size of the buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of received, unconsumed bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Free space left for the next receive.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    /// Returns true when no further bytes can be received.
    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    /// Returns true when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Received bytes not yet consumed.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Mutable view of the received bytes.
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.used]
    }

    /// Drops `n` bytes from the front, shifting the remainder forward.
    ///
    /// Consuming more than [`used`](Self::used) empties the buffer.
    pub fn consume(&mut self, n: usize) {
        if n >= self.used {
            self.used = 0;
            return;
        }
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Returns the underlying storage, e.g. to hand it back to a pool.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Unused tail that the next receive writes into.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Marks `n` freshly received bytes as used.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advance past capacity");
        self.used = (self.used + n).min(self.data.len());
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_READ_BUFFER_SIZE)
    }
}

// ============================================================================
// Write Queue
// ============================================================================

/// Result of crediting a send against the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Chunks fully sent and removed from the front.
    pub chunks: usize,
    /// True if the send ended inside a chunk, which is now the head.
    pub partial: bool,
}

/// FIFO of byte chunks waiting to be sent.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
}

impl WriteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Number of chunks queued.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total bytes queued across all chunks.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Borrows up to `max` leading chunks for a gather write.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.chunks
            .iter()
            .take(max)
            .map(|chunk| IoSlice::new(chunk))
            .collect()
    }

    /// Credits `n` sent bytes against the front of the queue.
    pub fn consume(&mut self, mut n: usize) -> Consumed {
        let mut consumed = Consumed {
            chunks: 0,
            partial: false,
        };

        while n > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            if n < head.len() {
                head.advance(n);
                self.queued_bytes -= n;
                consumed.partial = true;
                break;
            }
            n -= head.len();
            self.queued_bytes -= head.len();
            self.chunks.pop_front();
            consumed.chunks += 1;
        }

        debug_assert_eq!(n, 0, "credited more bytes than were queued");
        consumed
    }

    /// Drops every queued chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.queued_bytes = 0;
    }

    #[cfg(test)]
    pub(crate) fn concat(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}
