//! Vocabulary shared by the push and the pull model.
//!
//! - [`BodyError`]: every failure a body reader can observe
//! - [`BodySizeLimits`]: the hard body cap and the soft buffering cap
//! - [`BackpressureMode`] and [`Side`]: how the two halves of a split are reconciled
//! - [`JoinLatch`]: passes an action upstream only once both halves asked for it
//! - [`ClaimTracker`]: detects a body being consumed twice

mod error;
pub use error::BodyError;

mod limits;
pub use limits::BodySizeLimits;

mod mode;
pub use mode::BackpressureMode;
pub use mode::Side;

mod latch;
pub use latch::JoinLatch;

mod claim;
pub use claim::ClaimTracker;

mod message;
pub use message::PayloadItem;
