use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use http_body::{Body, Frame, SizeHint};
use tracing::trace;

use crate::flow::{BufferConsumer, DeclaredLength, Upstream};
use crate::protocol::{BodyError, PayloadItem};

type Item = Result<PayloadItem, BodyError>;

/// Creates a subscriber feeding a [`ChannelBody`].
///
/// The channel itself is unbounded: flow control happens through `upstream`, which the body
/// acknowledges every chunk to as it is handed to the reader.
pub(crate) fn channel(upstream: Arc<dyn Upstream>, declared: DeclaredLength) -> (ChannelSender, ChannelBody) {
    let (sender, receiver) = mpsc::unbounded();
    let body = ChannelBody { receiver, upstream, declared, yielded: 0, started: false, finished: false };
    (ChannelSender { sender }, body)
}

/// [`BufferConsumer`] half of the channel
#[derive(Debug)]
pub(crate) struct ChannelSender {
    sender: mpsc::UnboundedSender<Item>,
}

impl ChannelSender {
    fn send(&self, item: Item) {
        if self.sender.unbounded_send(item).is_err() {
            trace!("body reader is gone, drop item");
        }
    }
}

impl BufferConsumer<Bytes> for ChannelSender {
    fn add(&mut self, chunk: Bytes) {
        self.send(Ok(PayloadItem::Chunk(chunk)));
    }

    fn complete(&mut self) {
        self.send(Ok(PayloadItem::Eof));
        self.sender.close_channel();
    }

    fn error(&mut self, e: BodyError) {
        self.send(Err(e));
        self.sender.close_channel();
    }
}

/// One reader's view of a push-model body, as an [`http_body::Body`].
///
/// Starts its upstream on first poll and acknowledges each chunk when it yields it, so the
/// reader's pace is what upstream sees. Dropping an unfinished body allows upstream to discard
/// and stops it from waiting on this reader.
pub struct ChannelBody {
    receiver: mpsc::UnboundedReceiver<Item>,
    upstream: Arc<dyn Upstream>,
    declared: DeclaredLength,
    yielded: u64,
    started: bool,
    finished: bool,
}

impl fmt::Debug for ChannelBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBody")
            .field("declared", &self.declared.get())
            .field("yielded", &self.yielded)
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if !this.started {
            this.started = true;
            this.upstream.start();
        }

        match ready!(this.receiver.poll_next_unpin(cx)) {
            Some(Ok(PayloadItem::Chunk(bytes))) => {
                let len = bytes.len() as u64;
                this.yielded += len;
                this.upstream.on_bytes_consumed(len);
                Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            Some(Ok(PayloadItem::Eof)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Some(Err(e)) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finished = true;
                Poll::Ready(Some(Err(BodyError::illegal_state("body producer went away before the body ended"))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    /// What is left to read, as far as the declared length tells.
    fn size_hint(&self) -> SizeHint {
        if self.finished {
            return SizeHint::with_exact(0);
        }
        match self.declared.get() {
            Some(length) => SizeHint::with_exact(length.saturating_sub(self.yielded)),
            None => SizeHint::new(),
        }
    }
}

impl Drop for ChannelBody {
    fn drop(&mut self) {
        if !self.finished {
            trace!("body reader dropped before the end");
            self.upstream.allow_discard();
            self.upstream.disregard_backpressure();
        }
    }
}
