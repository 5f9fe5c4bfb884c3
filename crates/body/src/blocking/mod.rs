//! Pull model: readers block on [`std::io::Read`] and set the pace themselves.
//!
//! # Architecture
//!
//! - [`BlockingStream`]: a blocking source with advisory discard and hard cancellation
//! - [`StreamPair`]: splits one source into two [`PairSide`] readers under a
//!   [`BackpressureMode`](crate::protocol::BackpressureMode)
//! - [`ByteQueue`]: holds the bytes a lagging reader has not seen yet
//! - [`BlockingBody`]: the body handle readers split and claim
//!
//! Each side of a pair is expected to be read from its own thread: in the slowest and the mirror
//! modes a read blocks until the other side catches up or goes away.

mod byte_queue;
pub use byte_queue::ByteQueue;

mod stream;
pub use stream::BlockingStream;
pub use stream::ReadStream;

mod stream_pair;
pub use stream_pair::PairSide;
pub use stream_pair::StreamPair;

mod body;
pub use body::BlockingBody;

#[cfg(test)]
pub(crate) mod testing;
