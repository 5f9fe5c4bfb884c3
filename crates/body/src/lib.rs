//! Split one HTTP body between several readers with joined backpressure
//!
//! A request body normally has exactly one reader. Filters, mirroring and logging often need a
//! second look at the same bytes without buffering the whole body and without letting one reader
//! starve or flood the other. This crate splits a body into independent bodies over the same
//! data and merges the readers' demand back into the single signal the transport sees.
//!
//! # Features
//!
//! - Push model: a transport pushes chunks, readers acknowledge what they processed
//! - Pull model: readers block on [`std::io::Read`] and set the pace themselves
//! - Four backpressure modes: slowest reader, fastest reader, original body, new body
//! - Lock-free demand balancing for the push model
//! - Bounded buffering for late subscribers and full-body readers
//! - Content length enforcement against the declared length and a hard body cap
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use http_body_util::BodyExt;
//! use micro_body::flow::{BodyProducer, BufferConsumer, StreamingBody, Upstream, streaming_body};
//! use micro_body::protocol::{BackpressureMode, BodySizeLimits};
//!
//! struct Socket;
//!
//! impl Upstream for Socket {
//!     fn on_bytes_consumed(&self, _bytes_consumed: u64) {
//!         // ask the connection for that many more bytes
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut body, mut producer): (StreamingBody, BodyProducer) = streaming_body(BodySizeLimits::default(), Arc::new(Socket));
//! let mut mirror = body.split(BackpressureMode::Original)?;
//!
//! let handler_body = body.into_body()?;
//! let mirror_body = mirror.into_body()?;
//!
//! producer.set_expected_length(5);
//! producer.add(Bytes::from_static(b"hello"));
//! producer.complete();
//!
//! let (handler_bytes, mirror_bytes) = tokio::join!(handler_body.collect(), mirror_body.collect());
//! assert_eq!(handler_bytes?.to_bytes(), mirror_bytes?.to_bytes());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: errors, size limits, backpressure modes and the small synchronization
//!   helpers shared by both models
//! - [`flow`]: the push model, built around [`flow::SharedBuffer`] and
//!   [`flow::UpstreamBalancer`]
//! - [`blocking`]: the pull model, built around [`blocking::StreamPair`]
//!
//! # Error Handling
//!
//! Every failure a reader can observe is a [`protocol::BodyError`]. Blocking readers see it
//! wrapped in an [`std::io::Error`] whose kind is preserved, and converting back yields the
//! original error.

pub mod blocking;
pub mod flow;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
