use std::io::{self, Read};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::blocking::BlockingStream;

/// `len` bytes of a repeating, non-trivial pattern.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

#[derive(Debug, Default)]
pub(crate) struct SourceCounters {
    discards: AtomicUsize,
    cancels: AtomicUsize,
}

impl SourceCounters {
    pub(crate) fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// In-memory upstream that hands out at most `max_read` bytes per call, can fail at a given
/// offset and can block at another one until released.
#[derive(Debug)]
pub(crate) struct TestSource {
    data: Vec<u8>,
    position: usize,
    max_read: usize,
    fail_at: Option<usize>,
    gate: Option<(usize, Receiver<()>)>,
    counters: Arc<SourceCounters>,
}

impl TestSource {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0, max_read: usize::MAX, fail_at: None, gate: None, counters: Arc::default() }
    }

    pub(crate) fn max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    pub(crate) fn fail_at(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// The read starting at `offset` blocks until `release` receives a message or is dropped.
    pub(crate) fn gate_at(mut self, offset: usize, release: Receiver<()>) -> Self {
        self.gate = Some((offset, release));
        self
    }

    pub(crate) fn counters(&self) -> Arc<SourceCounters> {
        Arc::clone(&self.counters)
    }
}

impl Read for TestSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.gate.as_ref().is_some_and(|(offset, _)| *offset == self.position)
            && let Some((_, release)) = self.gate.take()
        {
            let _ = release.recv();
        }
        let end = self.fail_at.unwrap_or(self.data.len()).min(self.data.len());
        if self.fail_at == Some(self.position) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
        }
        let n = buf.len().min(self.max_read).min(end - self.position);
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl BlockingStream for TestSource {
    fn allow_discard(&mut self) {
        self.counters.discards.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel_input(&mut self) {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
    }
}
