//! Fan-out of one push-model body to several subscribers.
//!
//! A [`SharedBuffer`] receives chunks from a single producer and hands them to every streaming
//! subscriber that is attached. Data is only retained while somebody may still need it: a
//! subscriber that has reserved its place but not attached yet, or a full-body subscriber that
//! waits for the whole body.
//!
//! # Limits
//!
//! - `max_body_size` bounds the total length. Crossing it fails the body for everyone.
//! - `max_buffer_size` bounds the retained backlog. Crossing it abandons buffering for good:
//!   the backlog is dropped, pending full-body subscribers fail, and subscribers attaching later
//!   fail with [`BodyError::BufferLengthExceeded`]. Subscribers already streaming are unaffected.
//!
//! # Execution model
//!
//! Producer calls (`add`, `complete`, `error`) and subscription calls take `&mut self`, so a
//! single owner serializes them. Subscribers acknowledge data through their own [`Upstream`],
//! which never goes through the buffer.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use futures::channel::oneshot;
use http::HeaderMap;
use http::header::CONTENT_LENGTH;
use tracing::{debug, error, trace};

use crate::ensure;
use crate::flow::{BufferConsumer, Upstream};
use crate::protocol::{BodyError, BodySizeLimits};

/// How one chunk representation is forwarded, retained and assembled.
///
/// Implemented once per concrete chunk type, see [`BytesStrategy`].
pub trait BufferStrategy: Send + 'static {
    type Chunk: Send;
    type Backlog: Default + Send;
    type Full: Clone + Send;

    fn len(chunk: &Self::Chunk) -> u64;

    /// Produces the copy of `chunk` handed to one subscriber.
    fn forward(chunk: &Self::Chunk) -> Self::Chunk;

    fn buffer(backlog: &mut Self::Backlog, chunk: Self::Chunk);

    /// Hands every retained chunk, in order, to a subscriber attaching late.
    fn replay(backlog: &Self::Backlog, consumer: &mut dyn BufferConsumer<Self::Chunk>);

    fn discard(backlog: &mut Self::Backlog);

    /// Assembles the retained chunks into the whole body.
    fn to_full(backlog: &Self::Backlog) -> Self::Full;
}

/// Strategy for [`Bytes`] chunks: forwarding is a reference count bump, the full body is one
/// contiguous [`Bytes`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesStrategy;

impl BufferStrategy for BytesStrategy {
    type Chunk = Bytes;
    type Backlog = Vec<Bytes>;
    type Full = Bytes;

    #[inline]
    fn len(chunk: &Bytes) -> u64 {
        chunk.len() as u64
    }

    #[inline]
    fn forward(chunk: &Bytes) -> Bytes {
        chunk.clone()
    }

    fn buffer(backlog: &mut Vec<Bytes>, chunk: Bytes) {
        if !chunk.is_empty() {
            backlog.push(chunk);
        }
    }

    fn replay(backlog: &Vec<Bytes>, consumer: &mut dyn BufferConsumer<Bytes>) {
        for chunk in backlog {
            consumer.add(chunk.clone());
        }
    }

    fn discard(backlog: &mut Vec<Bytes>) {
        backlog.clear();
        backlog.shrink_to_fit();
    }

    fn to_full(backlog: &Vec<Bytes>) -> Bytes {
        match backlog.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut full = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in chunks {
                    full.extend_from_slice(chunk);
                }
                full.freeze()
            }
        }
    }
}

const UNKNOWN_LENGTH: u64 = u64::MAX;

/// The expected body length, readable without going through the buffer.
///
/// Updated whenever a length is declared and when the body completes.
#[derive(Debug, Clone)]
pub struct DeclaredLength(Arc<AtomicU64>);

impl DeclaredLength {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(UNKNOWN_LENGTH)))
    }

    pub(crate) fn set(&self, length: u64) {
        self.0.store(length, Ordering::Release);
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            UNKNOWN_LENGTH => None,
            length => Some(length),
        }
    }
}

impl Default for DeclaredLength {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone)]
enum UpstreamCall {
    Start,
    AllowDiscard,
    DisregardBackpressure,
}

impl UpstreamCall {
    fn apply(self, upstream: &dyn Upstream) {
        match self {
            UpstreamCall::Start => upstream.start(),
            UpstreamCall::AllowDiscard => upstream.allow_discard(),
            UpstreamCall::DisregardBackpressure => upstream.disregard_backpressure(),
        }
    }
}

/// Upstream calls held back while the buffer was borrowed.
///
/// A buffer shared behind a lock collects them (see [`SharedBuffer::defer_upstream_calls`]) so
/// that they can be made after the lock is released: upstream is free to call back into the
/// buffer from any of them.
#[must_use = "held back upstream calls must be run"]
#[derive(Default)]
pub struct UpstreamCalls(Vec<(Arc<dyn Upstream>, UpstreamCall)>);

impl UpstreamCalls {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn run(self) {
        for (upstream, call) in self.0 {
            call.apply(upstream.as_ref());
        }
    }
}

impl fmt::Debug for UpstreamCalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|(_, call)| call)).finish()
    }
}

fn call_upstream(deferred: &mut Option<UpstreamCalls>, upstream: &Arc<dyn Upstream>, call: UpstreamCall) {
    match deferred {
        Some(calls) => calls.0.push((Arc::clone(upstream), call)),
        None => call.apply(upstream.as_ref()),
    }
}

struct FullSubscriber<F> {
    sender: oneshot::Sender<Result<F, BodyError>>,
    upstream: Arc<dyn Upstream>,
}

impl<F> FullSubscriber<F> {
    fn resolve(self, result: Result<F, BodyError>) {
        // the receiver may have been dropped, nobody is interested anymore
        let _ = self.sender.send(result);
    }
}

/// Fans a single push stream out to streaming and full-body subscribers.
///
/// Starts with one reservation: the body this buffer was created for.
pub struct SharedBuffer<S: BufferStrategy> {
    limits: BodySizeLimits,
    root_upstream: Arc<dyn Upstream>,
    reserved: usize,
    subscribers: Vec<Box<dyn BufferConsumer<S::Chunk>>>,
    full_subscribers: Vec<FullSubscriber<S::Full>>,
    backlog: S::Backlog,
    buffering_abandoned: bool,
    complete: bool,
    error: Option<BodyError>,
    length_so_far: u64,
    expected_length: Option<u64>,
    declared: DeclaredLength,
    deferred: Option<UpstreamCalls>,
}

impl<S: BufferStrategy> SharedBuffer<S> {
    pub fn new(limits: BodySizeLimits, root_upstream: Arc<dyn Upstream>) -> Self {
        Self {
            limits,
            root_upstream,
            reserved: 1,
            subscribers: Vec::new(),
            full_subscribers: Vec::new(),
            backlog: S::Backlog::default(),
            buffering_abandoned: false,
            complete: false,
            error: None,
            length_so_far: 0,
            expected_length: None,
            declared: DeclaredLength::new(),
            deferred: None,
        }
    }

    /// Holds back upstream calls until [`take_upstream_calls`](Self::take_upstream_calls)
    /// instead of making them right away.
    pub fn defer_upstream_calls(mut self) -> Self {
        self.deferred = Some(UpstreamCalls::default());
        self
    }

    pub fn take_upstream_calls(&mut self) -> UpstreamCalls {
        self.deferred.as_mut().map(mem::take).unwrap_or_default()
    }

    #[inline]
    pub fn limits(&self) -> BodySizeLimits {
        self.limits
    }

    #[inline]
    pub fn length_so_far(&self) -> u64 {
        self.length_so_far
    }

    #[inline]
    pub fn expected_length(&self) -> Option<u64> {
        self.expected_length
    }

    /// A handle that follows the expected length as it gets declared.
    pub fn declared_length(&self) -> DeclaredLength {
        self.declared.clone()
    }

    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[inline]
    pub fn failure(&self) -> Option<&BodyError> {
        self.error.as_ref()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.complete || self.error.is_some()
    }

    /// Terminal with no reservation left: nothing can observe this buffer anymore.
    pub fn is_finished(&self) -> bool {
        self.is_terminal() && self.reserved == 0
    }

    /// Promises one more future `subscribe` or `subscribe_full` call.
    pub fn reserve(&mut self) -> Result<(), BodyError> {
        ensure!(
            self.reserved > 0 || !self.full_subscribers.is_empty(),
            BodyError::illegal_state("cannot go back from streaming to buffering")
        );
        self.reserved += 1;
        trace!(reserved = self.reserved, "reserved subscriber");
        Ok(())
    }

    fn take_reservation(&mut self) -> Result<(), BodyError> {
        ensure!(self.reserved > 0, BodyError::illegal_state("subscribe without reservation"));
        self.reserved -= 1;
        Ok(())
    }

    fn release_backlog_if_unneeded(&mut self) {
        if self.reserved == 0 && self.full_subscribers.is_empty() {
            S::discard(&mut self.backlog);
        }
    }

    /// Declares the body length. A declaration above `max_body_size` fails the body right away.
    pub fn set_expected_length(&mut self, length: u64) {
        if self.is_terminal() {
            return;
        }
        if let Some(expected) = self.expected_length
            && length < expected
        {
            trace!(expected, length, "ignore shrinking expected length");
            return;
        }
        if length > self.limits.max_body_size() {
            error!(length, max_body_size = self.limits.max_body_size(), "declared length exceeds the max body size");
            self.fail_content_length(self.limits.max_body_size(), length);
            return;
        }
        if length < self.length_so_far {
            error!(length, length_so_far = self.length_so_far, "declared length smaller than what was received");
            self.fail_content_length(length, self.length_so_far);
            return;
        }
        self.expected_length = Some(length);
        self.declared.set(length);
    }

    /// Like [`set_expected_length`](Self::set_expected_length), from a `Content-Length` value.
    /// Values that are not a non-negative integer are ignored.
    pub fn set_expected_length_from_header_value(&mut self, value: &str) {
        match value.trim().parse::<u64>() {
            Ok(length) => self.set_expected_length(length),
            Err(e) => trace!(value, cause = %e, "ignore invalid content-length"),
        }
    }

    pub fn set_expected_length_from_headers(&mut self, headers: &HeaderMap) {
        if let Some(value) = headers.get(CONTENT_LENGTH).and_then(|value| value.to_str().ok()) {
            self.set_expected_length_from_header_value(value);
        }
    }

    /// Attaches a streaming subscriber, consuming one reservation.
    ///
    /// Retained data is replayed first. If buffering was already abandoned, only this
    /// subscriber fails, and its upstream is told it may discard.
    pub fn subscribe(&mut self, mut consumer: Box<dyn BufferConsumer<S::Chunk>>, upstream: Arc<dyn Upstream>) -> Result<(), BodyError> {
        self.take_reservation()?;

        if let Some(e) = &self.error {
            consumer.error(e.clone());
            return Ok(());
        }

        if self.length_so_far > self.limits.max_buffer_size() {
            debug!(length_so_far = self.length_so_far, max_buffer_size = self.limits.max_buffer_size(), "subscribed too late, backlog is gone");
            consumer.error(BodyError::buffer_length_exceeded(self.limits.max_buffer_size(), self.length_so_far));
            call_upstream(&mut self.deferred, &upstream, UpstreamCall::AllowDiscard);
            self.release_backlog_if_unneeded();
            return Ok(());
        }

        S::replay(&self.backlog, &mut *consumer);
        self.release_backlog_if_unneeded();

        if self.complete {
            consumer.complete();
        } else {
            self.subscribers.push(consumer);
        }
        Ok(())
    }

    /// Attaches a subscriber that wants the whole body at once, consuming one reservation.
    ///
    /// The subscriber does not acknowledge incrementally, so its upstream is started and stops
    /// applying backpressure. With `can_return_immediate` a body that is already terminal is
    /// returned without going through a channel.
    pub fn subscribe_full(&mut self, upstream: Arc<dyn Upstream>, can_return_immediate: bool) -> Result<FullBody<S::Full>, BodyError> {
        self.take_reservation()?;

        let terminal = if let Some(e) = &self.error {
            Some(Err(e.clone()))
        } else if self.complete {
            Some(self.full_result())
        } else {
            None
        };

        if let Some(result) = terminal {
            self.release_backlog_if_unneeded();
            if can_return_immediate {
                return Ok(FullBody::ready(result));
            }
            let (sender, receiver) = oneshot::channel();
            let _ = sender.send(result);
            return Ok(FullBody::pending(receiver));
        }

        if self.buffering_abandoned {
            call_upstream(&mut self.deferred, &upstream, UpstreamCall::AllowDiscard);
            self.release_backlog_if_unneeded();
            return Ok(FullBody::ready(Err(BodyError::buffer_length_exceeded(
                self.limits.max_buffer_size(),
                self.length_so_far,
            ))));
        }

        let (sender, receiver) = oneshot::channel();
        call_upstream(&mut self.deferred, &upstream, UpstreamCall::Start);
        call_upstream(&mut self.deferred, &upstream, UpstreamCall::DisregardBackpressure);
        self.full_subscribers.push(FullSubscriber { sender, upstream });
        Ok(FullBody::pending(receiver))
    }

    fn full_result(&self) -> Result<S::Full, BodyError> {
        ensure!(
            self.length_so_far <= self.limits.max_buffer_size(),
            BodyError::buffer_length_exceeded(self.limits.max_buffer_size(), self.length_so_far)
        );
        Ok(S::to_full(&self.backlog))
    }

    /// Admits one chunk from the producer.
    pub fn add(&mut self, chunk: S::Chunk) {
        if self.is_terminal() {
            trace!("drop chunk received after the body finished");
            return;
        }

        let new_length = self.length_so_far.saturating_add(S::len(&chunk));

        if let Some(expected) = self.expected_length
            && new_length > expected
        {
            error!(expected, new_length, "received more bytes than declared");
            self.fail_content_length(expected, new_length);
            return;
        }

        if new_length > self.limits.max_body_size() {
            error!(new_length, max_body_size = self.limits.max_body_size(), "body exceeds the max body size");
            self.fail_content_length(self.limits.max_body_size(), new_length);
            return;
        }

        self.length_so_far = new_length;

        for subscriber in &mut self.subscribers {
            subscriber.add(S::forward(&chunk));
        }

        if self.reserved == 0 && self.full_subscribers.is_empty() {
            return;
        }

        if self.buffering_abandoned {
            return;
        }

        if new_length > self.limits.max_buffer_size() {
            self.abandon_buffering();
        } else {
            trace!(new_length, "buffer chunk for later subscribers");
            S::buffer(&mut self.backlog, chunk);
        }
    }

    fn abandon_buffering(&mut self) {
        debug!(
            length_so_far = self.length_so_far,
            max_buffer_size = self.limits.max_buffer_size(),
            pending_full = self.full_subscribers.len(),
            "buffer limit exceeded, abandon buffering"
        );
        self.buffering_abandoned = true;
        S::discard(&mut self.backlog);

        let e = BodyError::buffer_length_exceeded(self.limits.max_buffer_size(), self.length_so_far);
        for full in self.full_subscribers.drain(..) {
            call_upstream(&mut self.deferred, &full.upstream, UpstreamCall::AllowDiscard);
            full.resolve(Err(e.clone()));
        }
    }

    fn fail_content_length(&mut self, limit: u64, received: u64) {
        self.error(BodyError::content_length_exceeded(limit, received));
        call_upstream(&mut self.deferred, &self.root_upstream, UpstreamCall::AllowDiscard);
    }

    /// The producer finished. Fails instead if fewer bytes than declared were received.
    pub fn complete(&mut self) {
        if self.is_terminal() {
            return;
        }

        if let Some(expected) = self.expected_length
            && self.length_so_far < expected
        {
            error!(expected, length_so_far = self.length_so_far, "body ended before the declared length");
            self.error(BodyError::content_length_exceeded(expected, self.length_so_far));
            return;
        }

        self.expected_length = Some(self.length_so_far);
        self.declared.set(self.length_so_far);
        self.complete = true;
        trace!(length = self.length_so_far, subscribers = self.subscribers.len(), "body complete");

        for mut subscriber in self.subscribers.drain(..) {
            subscriber.complete();
        }

        if !self.full_subscribers.is_empty() {
            let full = self.full_result();
            for subscriber in self.full_subscribers.drain(..) {
                subscriber.resolve(full.clone());
            }
        }

        self.release_backlog_if_unneeded();
    }

    /// The producer failed. The first error sticks, later producer calls are ignored.
    pub fn error(&mut self, e: BodyError) {
        if self.is_terminal() {
            return;
        }
        debug!(cause = %e, subscribers = self.subscribers.len(), "body failed");
        self.error = Some(e.clone());
        S::discard(&mut self.backlog);

        for mut subscriber in self.subscribers.drain(..) {
            subscriber.error(e.clone());
        }
        for subscriber in self.full_subscribers.drain(..) {
            subscriber.resolve(Err(e.clone()));
        }
    }

    /// The producer honoured a discard request: the rest of the body will never arrive.
    pub fn discard(&mut self) {
        if self.is_terminal() {
            return;
        }
        debug!(subscribers = self.subscribers.len(), "body discarded");
        self.error = Some(BodyError::BodyDiscarded);
        S::discard(&mut self.backlog);

        for mut subscriber in self.subscribers.drain(..) {
            subscriber.discard();
        }
        for subscriber in self.full_subscribers.drain(..) {
            subscriber.resolve(Err(BodyError::BodyDiscarded));
        }
    }
}

impl<S: BufferStrategy> BufferConsumer<S::Chunk> for SharedBuffer<S> {
    fn add(&mut self, chunk: S::Chunk) {
        SharedBuffer::add(self, chunk);
    }

    fn complete(&mut self) {
        SharedBuffer::complete(self);
    }

    fn error(&mut self, e: BodyError) {
        SharedBuffer::error(self, e);
    }

    fn discard(&mut self) {
        SharedBuffer::discard(self);
    }
}

impl<S: BufferStrategy> fmt::Debug for SharedBuffer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("limits", &self.limits)
            .field("reserved", &self.reserved)
            .field("subscribers", &self.subscribers.len())
            .field("full_subscribers", &self.full_subscribers.len())
            .field("buffering_abandoned", &self.buffering_abandoned)
            .field("complete", &self.complete)
            .field("error", &self.error)
            .field("length_so_far", &self.length_so_far)
            .field("expected_length", &self.expected_length)
            .finish_non_exhaustive()
    }
}

/// The whole body, once it is available.
#[derive(Debug)]
pub struct FullBody<T> {
    inner: FullInner<T>,
}

#[derive(Debug)]
enum FullInner<T> {
    Ready(Option<Result<T, BodyError>>),
    Pending(oneshot::Receiver<Result<T, BodyError>>),
}

// the result is never pinned structurally
impl<T> Unpin for FullBody<T> {}

impl<T> FullBody<T> {
    pub(crate) fn ready(result: Result<T, BodyError>) -> Self {
        Self { inner: FullInner::Ready(Some(result)) }
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<Result<T, BodyError>>) -> Self {
        Self { inner: FullInner::Pending(receiver) }
    }

    /// Whether the result was available when this was created, no waiting involved.
    pub fn is_immediate(&self) -> bool {
        matches!(self.inner, FullInner::Ready(Some(_)))
    }
}

impl<T> Future for FullBody<T> {
    type Output = Result<T, BodyError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            FullInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or_else(|| Err(BodyError::illegal_state("full body polled after completion"))))
            }
            FullInner::Pending(receiver) => match ready!(receiver.poll_unpin(cx)) {
                Ok(result) => Poll::Ready(result),
                Err(_canceled) => Poll::Ready(Err(BodyError::illegal_state("body dropped before it completed"))),
            },
        }
    }
}
