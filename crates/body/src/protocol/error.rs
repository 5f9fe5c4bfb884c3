use std::io;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;

/// Failure observed by a body reader.
///
/// A single failure is usually fanned out to every subscriber of a split body, so the error is
/// cheap to clone. I/O errors coming from the transport are shared through an [`Arc`].
#[derive(Error, Debug, Clone)]
pub enum BodyError {
    /// The declared content length or the configured max body size was violated.
    #[error("content length exceeded, limit: {limit}, received: {received}")]
    ContentLengthExceeded { limit: u64, received: u64 },

    /// The body grew past the buffer limit while a late subscriber or a full-body reader still
    /// needed the backlog. Streaming subscribers that were already attached are unaffected.
    #[error("buffer length exceeded, limit: {limit}, received: {received}")]
    BufferLengthExceeded { limit: u64, received: u64 },

    #[error("body discarded")]
    BodyDiscarded,

    /// The body was consumed or split after it had already been claimed by another reader.
    #[error("body already claimed{}", claim_site(.claimed_at))]
    AlreadyClaimed { claimed_at: Option<&'static Location<'static>> },

    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    #[error("io error: {source}")]
    Io { source: Arc<io::Error> },
}

fn claim_site(location: &Option<&'static Location<'static>>) -> String {
    match location {
        Some(location) => format!(", first claimed at {location}"),
        None => String::new(),
    }
}

impl BodyError {
    pub fn content_length_exceeded(limit: u64, received: u64) -> Self {
        Self::ContentLengthExceeded { limit, received }
    }

    pub fn buffer_length_exceeded(limit: u64, received: u64) -> Self {
        Self::BufferLengthExceeded { limit, received }
    }

    pub fn illegal_state<S: ToString>(str: S) -> Self {
        Self::IllegalState { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: Arc::new(e.into()) }
    }
}

impl From<io::Error> for BodyError {
    fn from(e: io::Error) -> Self {
        // unwrap errors that went through `io::Error` on their way out of a blocking reader
        if let Some(inner) = e.get_ref().and_then(|inner| inner.downcast_ref::<BodyError>()) {
            return inner.clone();
        }
        Self::io(e)
    }
}

impl From<BodyError> for io::Error {
    fn from(e: BodyError) -> Self {
        match e {
            // keep the original kind so readers can still match on it
            BodyError::Io { source } => io::Error::new(source.kind(), BodyError::Io { source }),
            BodyError::BodyDiscarded => io::Error::new(io::ErrorKind::BrokenPipe, e),
            other => io::Error::other(other),
        }
    }
}
