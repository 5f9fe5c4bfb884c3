/// Default hard cap for a single body: 8MB
const DEFAULT_MAX_BODY_SIZE: u64 = 8 * 1024 * 1024;

/// Default cap on retained backlog: 64KB
const DEFAULT_MAX_BUFFER_SIZE: u64 = 64 * 1024;

/// Size limits applied to one body.
///
/// - `max_body_size` is a hard cap on the total body length. Violating it fails the body for every
///   reader.
/// - `max_buffer_size` is a soft cap on how much data may be retained for readers that have not
///   attached yet or that want the whole body at once. Violating it only affects those readers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BodySizeLimits {
    max_body_size: u64,
    max_buffer_size: u64,
}

impl BodySizeLimits {
    pub const UNLIMITED: BodySizeLimits = BodySizeLimits { max_body_size: u64::MAX, max_buffer_size: u64::MAX };

    pub const fn new(max_body_size: u64, max_buffer_size: u64) -> Self {
        Self { max_body_size, max_buffer_size }
    }

    #[inline]
    pub const fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    #[inline]
    pub const fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }
}

impl Default for BodySizeLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_BUFFER_SIZE)
    }
}
