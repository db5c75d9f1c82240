//! socksrotor-core/src/buffer.rs
//! C3: per-connection I/O buffers with adaptive resizing.
//!
//! Input and pending-output are kept strictly separate (per the §9 design
//! note on buffer aliasing): the reactor only ever fills `input`, and
//! un-written bytes destined for the peer queue up in `pending_output`
//! rather than being spliced back into the same buffer.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Minimum capacity for a SOCKS-upstream connection's input buffer.
pub const BASELINE_CAPACITY: usize = 8 * 1024;
/// Minimum capacity once a connection is known to speak HTTP upstream, or
/// is on the direct path.
pub const HTTP_OR_DIRECT_CAPACITY: usize = 256 * 1024;
/// Floor capacity after an overflow-triggered doubling for HTTP upstreams.
pub const HTTP_OVERFLOW_FLOOR: usize = 1024 * 1024;

pub struct BufferPair {
    input: BytesMut,
    pending_output: VecDeque<Bytes>,
}

impl BufferPair {
    pub fn new(min_capacity: usize) -> Self {
        Self {
            input: BytesMut::with_capacity(min_capacity.max(BASELINE_CAPACITY)),
            pending_output: VecDeque::new(),
        }
    }

    pub fn input_mut(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    pub fn input(&self) -> &BytesMut {
        &self.input
    }

    /// Grows `input`'s capacity to at least `n`, preserving any pending
    /// bytes. Capacity never shrinks.
    pub fn ensure_capacity(&mut self, n: usize) {
        if self.input.capacity() < n {
            let mut grown = BytesMut::with_capacity(n);
            grown.extend_from_slice(&self.input);
            self.input = grown;
        }
    }

    pub fn queue_output(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.pending_output.push_back(bytes);
        }
    }

    pub fn has_pending_output(&self) -> bool {
        !self.pending_output.is_empty()
    }

    pub fn pop_pending_output(&mut self) -> Option<Bytes> {
        self.pending_output.pop_front()
    }
}
