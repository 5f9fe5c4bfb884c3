use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::flow::channel::{self, ChannelBody};
use crate::flow::{
    BufferConsumer, BufferStrategy, BytesStrategy, DiscardingConsumer, FullBody, SharedBuffer, Upstream, UpstreamBalancer,
};
use crate::protocol::{BackpressureMode, BodyError, BodySizeLimits, ClaimTracker};

/// Creates a push-model body over `upstream` together with the producer that feeds it.
///
/// The transport delivers chunks through the returned [`BodyProducer`]; readers obtain the data
/// through the [`StreamingBody`] and any body split from it.
pub fn streaming_body<S: BufferStrategy>(limits: BodySizeLimits, upstream: Arc<dyn Upstream>) -> (StreamingBody<S>, BodyProducer<S>) {
    let buffer = Arc::new(Mutex::new(SharedBuffer::new(limits, Arc::clone(&upstream)).defer_upstream_calls()));
    let body = StreamingBody { buffer: Arc::clone(&buffer), upstream: Some(upstream), claim: ClaimTracker::new() };
    (body, BodyProducer { buffer })
}

/// Runs `f` on the locked buffer, then makes the upstream calls it held back once the lock is
/// released. Upstream may call back into the body from any of them.
fn with_buffer<S: BufferStrategy, T>(buffer: &Mutex<SharedBuffer<S>>, f: impl FnOnce(&mut SharedBuffer<S>) -> T) -> T {
    let mut guard = buffer.lock();
    let result = f(&mut guard);
    let calls = guard.take_upstream_calls();
    drop(guard);
    calls.run();
    result
}

/// Producer half of a push-model body: the transport pushes chunks and the terminal signal here.
pub struct BodyProducer<S: BufferStrategy = BytesStrategy> {
    buffer: Arc<Mutex<SharedBuffer<S>>>,
}

impl<S: BufferStrategy> BodyProducer<S> {
    pub fn set_expected_length(&self, length: u64) {
        with_buffer(&self.buffer, |buffer| buffer.set_expected_length(length));
    }

    pub fn set_expected_length_from_header_value(&self, value: &str) {
        with_buffer(&self.buffer, |buffer| buffer.set_expected_length_from_header_value(value));
    }

    pub fn set_expected_length_from_headers(&self, headers: &HeaderMap) {
        with_buffer(&self.buffer, |buffer| buffer.set_expected_length_from_headers(headers));
    }

    pub fn length_so_far(&self) -> u64 {
        self.buffer.lock().length_so_far()
    }

    /// Whether every reader is done and no reservation is outstanding.
    pub fn is_finished(&self) -> bool {
        self.buffer.lock().is_finished()
    }
}

impl<S: BufferStrategy> BufferConsumer<S::Chunk> for BodyProducer<S> {
    fn add(&mut self, chunk: S::Chunk) {
        with_buffer(&self.buffer, |buffer| buffer.add(chunk));
    }

    fn complete(&mut self) {
        with_buffer(&self.buffer, |buffer| buffer.complete());
    }

    fn error(&mut self, e: BodyError) {
        with_buffer(&self.buffer, |buffer| buffer.error(e));
    }

    fn discard(&mut self) {
        with_buffer(&self.buffer, |buffer| buffer.discard());
    }
}

impl<S: BufferStrategy> fmt::Debug for BodyProducer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyProducer").finish_non_exhaustive()
    }
}

/// A push-model body handle that can be split, streamed, or buffered whole.
///
/// Each handle owns one reservation on the shared buffer and may be claimed exactly once:
/// by [`subscribe`](Self::subscribe), [`buffer`](Self::buffer) or
/// [`into_body`](Self::into_body). Splitting does not claim the handle.
///
/// A handle dropped unclaimed still honours its reservation: it subscribes a discarding
/// consumer and stops applying backpressure, so the other readers are not held back.
///
/// Subscribers are called with the shared buffer locked. They must not split, claim or drop
/// body handles from inside those calls. Upstream is only called once the lock is released and
/// may push to the producer from there.
pub struct StreamingBody<S: BufferStrategy = BytesStrategy> {
    buffer: Arc<Mutex<SharedBuffer<S>>>,
    upstream: Option<Arc<dyn Upstream>>,
    claim: ClaimTracker,
}

impl<S: BufferStrategy> StreamingBody<S> {
    fn upstream(&self) -> Result<&Arc<dyn Upstream>, BodyError> {
        self.claim.ensure_unclaimed()?;
        self.upstream.as_ref().ok_or_else(|| BodyError::illegal_state("body has no upstream"))
    }

    /// Attaches this handle to the buffer with `attach` and claims it once that succeeded.
    /// A failed attach leaves the handle unclaimed, so dropping it still settles its reservation.
    #[track_caller]
    fn claim_with<T>(
        &mut self,
        attach: impl FnOnce(&mut SharedBuffer<S>, Arc<dyn Upstream>) -> Result<T, BodyError>,
    ) -> Result<T, BodyError> {
        let upstream = Arc::clone(self.upstream()?);
        let attached = with_buffer(&self.buffer, |buffer| attach(buffer, upstream))?;
        self.claim.claim()?;
        self.upstream = None;
        Ok(attached)
    }

    pub fn is_claimed(&self) -> bool {
        self.claim.is_claimed()
    }

    pub fn limits(&self) -> BodySizeLimits {
        self.buffer.lock().limits()
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.buffer.lock().expected_length()
    }

    /// Splits off a new independent body over the same data.
    ///
    /// This handle keeps the left side of the balanced upstream, the returned body gets the
    /// right side.
    pub fn split(&mut self, mode: BackpressureMode) -> Result<StreamingBody<S>, BodyError> {
        let upstream = Arc::clone(self.upstream()?);
        self.buffer.lock().reserve()?;

        let (left, right) = UpstreamBalancer::pair(upstream, mode);
        trace!(?mode, "split streaming body");
        self.upstream = Some(Arc::new(left));

        Ok(StreamingBody { buffer: Arc::clone(&self.buffer), upstream: Some(Arc::new(right)), claim: ClaimTracker::new() })
    }

    /// Claims the body for `consumer`. Returns the upstream the consumer acknowledges to.
    #[track_caller]
    pub fn subscribe<C>(&mut self, consumer: C) -> Result<Arc<dyn Upstream>, BodyError>
    where
        C: BufferConsumer<S::Chunk> + 'static,
    {
        self.claim_with(|buffer, upstream| {
            buffer.subscribe(Box::new(consumer), Arc::clone(&upstream))?;
            Ok(upstream)
        })
    }

    /// Claims the body and resolves once the whole body is available.
    #[track_caller]
    pub fn buffer(&mut self) -> Result<FullBody<S::Full>, BodyError> {
        self.claim_with(|buffer, upstream| buffer.subscribe_full(upstream, true))
    }

    /// Advisory: this reader does not care about the rest of the data.
    pub fn allow_discard(&self) {
        if let Some(upstream) = &self.upstream {
            upstream.allow_discard();
        }
    }
}

impl StreamingBody<BytesStrategy> {
    /// Claims the body as an [`http_body::Body`] driven by its reader.
    #[track_caller]
    pub fn into_body(&mut self) -> Result<ChannelBody, BodyError> {
        self.claim_with(|buffer, upstream| {
            let (sender, body) = channel::channel(Arc::clone(&upstream), buffer.declared_length());
            buffer.subscribe(Box::new(sender), upstream)?;
            Ok(body)
        })
    }

    /// Claims the body and collects it into one contiguous buffer.
    #[track_caller]
    pub fn collect(&mut self) -> Result<FullBody<Bytes>, BodyError> {
        self.buffer()
    }
}

impl<S: BufferStrategy> Drop for StreamingBody<S> {
    fn drop(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            trace!("unclaimed streaming body dropped, discarding its share");
            upstream.allow_discard();
            upstream.disregard_backpressure();
            // the reservation has to be matched even though nobody reads
            if let Err(e) = with_buffer(&self.buffer, |buffer| buffer.subscribe(Box::new(DiscardingConsumer), upstream)) {
                debug!(cause = %e, "could not settle the reservation of a dropped streaming body");
            }
        }
    }
}

impl<S: BufferStrategy> fmt::Debug for StreamingBody<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBody").field("claim", &self.claim).finish_non_exhaustive()
    }
}
