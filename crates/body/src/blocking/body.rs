use std::fmt;
use std::io::{self, Read};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::blocking::{BlockingStream, ReadStream, StreamPair};
use crate::protocol::{BackpressureMode, BodyError, BodySizeLimits, ClaimTracker};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A pull-model body handle that can be split or claimed as a blocking stream.
///
/// Splitting replaces this handle's stream with the left side of a [`StreamPair`] and hands the
/// right side to the returned body. A handle dropped unclaimed cancels its stream.
pub struct BlockingBody {
    stream: Option<Box<dyn BlockingStream>>,
    limits: BodySizeLimits,
    claim: ClaimTracker,
}

impl BlockingBody {
    pub fn new<S: BlockingStream + 'static>(stream: S, limits: BodySizeLimits) -> Self {
        Self::from_boxed(Box::new(stream), limits)
    }

    pub fn from_read<R: Read + Send + 'static>(reader: R, limits: BodySizeLimits) -> Self {
        Self::new(ReadStream::new(reader), limits)
    }

    fn from_boxed(stream: Box<dyn BlockingStream>, limits: BodySizeLimits) -> Self {
        Self { stream: Some(stream), limits, claim: ClaimTracker::new() }
    }

    fn take_stream(&mut self) -> Result<Box<dyn BlockingStream>, BodyError> {
        self.stream.take().ok_or_else(|| BodyError::illegal_state("body has no stream"))
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.is_claimed()
    }

    pub fn limits(&self) -> BodySizeLimits {
        self.limits
    }

    /// Splits off a new independent body over the same data. Does not claim this handle.
    pub fn split(&mut self, mode: BackpressureMode) -> Result<BlockingBody, BodyError> {
        self.claim.ensure_unclaimed()?;
        let (left, right) = StreamPair::split(self.take_stream()?, mode);
        self.stream = Some(Box::new(left));
        Ok(Self::from_boxed(Box::new(right), self.limits))
    }

    /// Claims the body and hands out its stream.
    #[track_caller]
    pub fn into_stream(&mut self) -> Result<Box<dyn BlockingStream>, BodyError> {
        self.claim.ensure_unclaimed()?;
        let stream = self.take_stream()?;
        self.claim.claim()?;
        Ok(stream)
    }

    /// Claims the body and reads it to the end.
    ///
    /// Fails with [`BodyError::ContentLengthExceeded`] past the max body size and with
    /// [`BodyError::BufferLengthExceeded`] past the max buffer size. The stream is cancelled
    /// when a limit is hit.
    #[track_caller]
    pub fn read_to_end(&mut self) -> Result<Bytes, BodyError> {
        let limits = self.limits;
        let mut stream = self.into_stream()?;

        let mut body = BytesMut::new();
        let mut chunk = vec![0; READ_CHUNK_SIZE];
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let received = (body.len() + n) as u64;
            let exceeded = if received > limits.max_body_size() {
                Some(BodyError::content_length_exceeded(limits.max_body_size(), received))
            } else if received > limits.max_buffer_size() {
                Some(BodyError::buffer_length_exceeded(limits.max_buffer_size(), received))
            } else {
                None
            };
            if let Some(e) = exceeded {
                trace!(error = %e, "stopped reading body");
                stream.allow_discard();
                stream.cancel_input();
                return Err(e);
            }

            body.extend_from_slice(&chunk[..n]);
        }
        Ok(body.freeze())
    }

    /// Advisory: this reader does not care about the rest of the data.
    pub fn allow_discard(&mut self) {
        if let Some(stream) = &mut self.stream {
            stream.allow_discard();
        }
    }
}

impl Drop for BlockingBody {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            trace!("unclaimed blocking body dropped, cancelling its stream");
            stream.cancel_input();
        }
    }
}

impl fmt::Debug for BlockingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingBody").field("limits", &self.limits).field("claim", &self.claim).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::testing::{TestSource, pattern};
    use std::thread;

    #[test]
    fn split_bodies_read_everything() {
        let data = pattern(50_000);
        let mut body = BlockingBody::new(TestSource::new(data.clone()).max_read(1000), BodySizeLimits::UNLIMITED);
        let mut split = body.split(BackpressureMode::Slowest).unwrap();
        let mut third = split.split(BackpressureMode::Fastest).unwrap();

        let (a, b, c) = thread::scope(|s| {
            let a = s.spawn(|| body.read_to_end().unwrap());
            let b = s.spawn(|| split.read_to_end().unwrap());
            let c = s.spawn(|| third.read_to_end().unwrap());
            (a.join().unwrap(), b.join().unwrap(), c.join().unwrap())
        });
        assert_eq!(a, data);
        assert_eq!(b, data);
        assert_eq!(c, data);
    }

    #[test]
    fn claiming_twice_fails() {
        let mut body = BlockingBody::from_read(io::Cursor::new(b"abc".to_vec()), BodySizeLimits::default());

        assert_eq!(body.read_to_end().unwrap(), "abc");
        assert!(body.is_claimed());
        assert!(matches!(body.read_to_end(), Err(BodyError::AlreadyClaimed { .. })));
        assert!(matches!(body.into_stream(), Err(BodyError::AlreadyClaimed { .. })));
        assert!(matches!(body.split(BackpressureMode::New), Err(BodyError::AlreadyClaimed { .. })));
    }

    #[test]
    fn limits_stop_the_read() {
        let source = TestSource::new(pattern(300)).max_read(100);
        let counters = source.counters();
        let mut body = BlockingBody::new(source, BodySizeLimits::new(250, 1000));
        assert!(matches!(
            body.read_to_end(),
            Err(BodyError::ContentLengthExceeded { limit: 250, received: 300 })
        ));
        assert_eq!(counters.cancels(), 1);

        let mut body = BlockingBody::new(TestSource::new(pattern(300)).max_read(100), BodySizeLimits::new(1000, 150));
        assert!(matches!(
            body.read_to_end(),
            Err(BodyError::BufferLengthExceeded { limit: 150, received: 200 })
        ));
    }

    #[test]
    fn upstream_failure_keeps_its_kind() {
        let mut body = BlockingBody::new(TestSource::new(pattern(10)).fail_at(5), BodySizeLimits::UNLIMITED);
        let mut split = body.split(BackpressureMode::Fastest).unwrap();

        match body.read_to_end() {
            Err(BodyError::Io { source }) => assert_eq!(source.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(split.read_to_end(), Err(BodyError::Io { .. })));
    }

    #[test]
    fn dropping_unclaimed_bodies_cancels_upstream() {
        let source = TestSource::new(pattern(10));
        let counters = source.counters();
        let mut body = BlockingBody::new(source, BodySizeLimits::UNLIMITED);
        let split = body.split(BackpressureMode::Original).unwrap();

        body.allow_discard();
        drop(split);
        assert_eq!(counters.cancels(), 0);
        assert_eq!(counters.discards(), 0);

        drop(body);
        assert_eq!(counters.cancels(), 1);
    }
}
