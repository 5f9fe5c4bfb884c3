//! Push model: a producer pushes chunks, consumers acknowledge what they processed.
//!
//! # Architecture
//!
//! - [`BufferConsumer`] / [`Upstream`]: the two directions of the push protocol
//! - [`SharedBuffer`]: fans one producer out to streaming and full-body subscribers, retaining
//!   data only while a reserved subscriber may still need it
//! - [`UpstreamBalancer`]: merges the acknowledgements of the two halves of a split into the
//!   single demand upstream sees, without locking
//! - [`StreamingBody`] / [`BodyProducer`]: the body handle readers split and claim, and the
//!   handle the transport feeds
//! - [`ChannelBody`]: a claimed body exposed as an `http_body::Body`
//!
//! # Example Flow
//!
//! 1. The transport creates a body with [`streaming_body`] and keeps the [`BodyProducer`]
//! 2. A filter splits the body, the handler keeps the original
//! 3. Each reader claims its handle, e.g. with [`StreamingBody::into_body`]
//! 4. Acknowledgements from both readers are balanced and reach the transport as demand

mod consumer;
pub use consumer::BufferConsumer;
pub use consumer::DiscardingConsumer;
pub use consumer::Upstream;
#[cfg(test)]
pub(crate) use consumer::MockUpstream;

mod shared_buffer;
pub use shared_buffer::BufferStrategy;
pub use shared_buffer::BytesStrategy;
pub use shared_buffer::DeclaredLength;
pub use shared_buffer::FullBody;
pub use shared_buffer::SharedBuffer;
pub use shared_buffer::UpstreamCalls;

mod balancer;
pub use balancer::BalancedUpstream;
pub use balancer::UpstreamBalancer;

mod channel;
pub use channel::ChannelBody;

mod body;
pub use body::BodyProducer;
pub use body::StreamingBody;
pub use body::streaming_body;

#[cfg(test)]
pub(crate) mod testing;
