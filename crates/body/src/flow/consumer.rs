use crate::protocol::BodyError;

/// Receiving end of a push-model body.
///
/// A producer delivers chunks with [`add`](BufferConsumer::add) and finishes with exactly one of
/// [`complete`](BufferConsumer::complete), [`error`](BufferConsumer::error) or
/// [`discard`](BufferConsumer::discard). Calls into one consumer are never reentrant: the owning
/// component serializes them.
///
/// The consumer acknowledges what it has processed through the [`Upstream`] it was subscribed
/// with, possibly from another thread.
pub trait BufferConsumer<C>: Send {
    fn add(&mut self, chunk: C);

    fn complete(&mut self);

    fn error(&mut self, e: BodyError);

    /// Called when upstream honoured a discard request after this consumer stopped applying
    /// backpressure. The remaining data will never arrive.
    fn discard(&mut self) {
        self.error(BodyError::BodyDiscarded);
    }
}

/// Producer-facing control channel of a push-model body.
///
/// All methods take `&self` and may be called concurrently from any thread. Implementations
/// must never block the caller.
#[cfg_attr(test, mockall::automock)]
pub trait Upstream: Send + Sync {
    /// Hint that a consumer is ready. Producers may defer reading until this is called.
    fn start(&self) {}

    /// The consumer processed `bytes_consumed` more bytes and is ready for the same amount.
    fn on_bytes_consumed(&self, bytes_consumed: u64);

    /// The consumer no longer cares about the remaining data. Advisory: data may still arrive.
    fn allow_discard(&self) {}

    /// Stop accounting this consumer's demand: it accepts data as fast as it can come.
    fn disregard_backpressure(&self) {
        self.on_bytes_consumed(u64::MAX);
    }
}

impl<C, T> BufferConsumer<C> for Box<T>
where
    T: BufferConsumer<C> + ?Sized,
{
    fn add(&mut self, chunk: C) {
        (**self).add(chunk);
    }

    fn complete(&mut self) {
        (**self).complete();
    }

    fn error(&mut self, e: BodyError) {
        (**self).error(e);
    }

    fn discard(&mut self) {
        (**self).discard();
    }
}

/// Consumer that drops everything it receives.
///
/// Used to honour a reservation when a body handle is dropped without being read.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingConsumer;

impl<C> BufferConsumer<C> for DiscardingConsumer {
    fn add(&mut self, _chunk: C) {}

    fn complete(&mut self) {}

    fn error(&mut self, _e: BodyError) {}
}
