use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// FIFO of byte ranges held for a reader that is momentarily behind.
///
/// Not synchronized: the owner's lock protects it.
#[derive(Debug, Default)]
pub struct ByteQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a copy of `bytes`. The caller keeps ownership of its buffer.
    pub fn add_copy(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.chunks.push_back(Bytes::copy_from_slice(bytes));
    }

    /// Moves up to `dest.len()` bytes from the front of the queue into `dest`.
    /// Returns how many bytes were moved.
    pub fn take(&mut self, dest: &mut [u8]) -> usize {
        let mut taken = 0;
        while taken < dest.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(dest.len() - taken);
            dest[taken..taken + n].copy_from_slice(&front[..n]);
            front.advance(n);
            taken += n;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.len -= taken;
        taken
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
