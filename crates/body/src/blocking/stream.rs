use std::io::{self, Read};

/// A blocking body source: [`Read`] plus the two cancellation strengths.
///
/// - [`allow_discard`](BlockingStream::allow_discard) is advisory, data may still be delivered
/// - [`cancel_input`](BlockingStream::cancel_input) stops delivery for good
///
/// Both are idempotent.
pub trait BlockingStream: Read + Send {
    fn allow_discard(&mut self) {}

    fn cancel_input(&mut self) {}
}

impl<T: BlockingStream + ?Sized> BlockingStream for Box<T> {
    fn allow_discard(&mut self) {
        (**self).allow_discard();
    }

    fn cancel_input(&mut self) {
        (**self).cancel_input();
    }
}

/// Adapts any [`Read`] into a [`BlockingStream`]. Reads after `cancel_input` fail.
#[derive(Debug)]
pub struct ReadStream<R> {
    reader: R,
    cancelled: bool,
}

impl<R: Read + Send> ReadStream<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, cancelled: false }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> Read for ReadStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled {
            return Err(cancelled());
        }
        self.reader.read(buf)
    }
}

impl<R: Read + Send> BlockingStream for ReadStream<R> {
    fn cancel_input(&mut self) {
        self.cancelled = true;
    }
}

pub(crate) fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "input cancelled")
}
