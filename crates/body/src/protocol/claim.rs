use std::panic::Location;

use tracing::{Level, trace};

use crate::ensure;
use crate::protocol::BodyError;

/// Tracks whether a body handle has been handed to its one and only reader.
///
/// Claiming twice is a programming error. When TRACE logging is enabled the location of the
/// first claim is remembered so that the second claim can point at it.
#[derive(Debug, Default)]
pub struct ClaimTracker {
    claimed: bool,
    claimed_at: Option<&'static Location<'static>>,
}

impl ClaimTracker {
    pub const fn new() -> Self {
        Self { claimed: false, claimed_at: None }
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Fails if the body has already been claimed, without claiming it.
    pub fn ensure_unclaimed(&self) -> Result<(), BodyError> {
        ensure!(!self.claimed, BodyError::AlreadyClaimed { claimed_at: self.claimed_at });
        Ok(())
    }

    #[track_caller]
    pub fn claim(&mut self) -> Result<(), BodyError> {
        self.ensure_unclaimed()?;
        self.claimed = true;
        if tracing::enabled!(Level::TRACE) {
            let location = Location::caller();
            trace!(%location, "body claimed");
            self.claimed_at = Some(location);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails() {
        let mut tracker = ClaimTracker::new();
        assert!(tracker.ensure_unclaimed().is_ok());
        assert!(tracker.claim().is_ok());
        assert!(tracker.is_claimed());
        assert!(matches!(tracker.claim(), Err(BodyError::AlreadyClaimed { .. })));
        assert!(matches!(tracker.ensure_unclaimed(), Err(BodyError::AlreadyClaimed { .. })));
    }

    #[test]
    fn records_claim_site_with_trace_enabled() {
        let subscriber = tracing_subscriber::fmt().with_max_level(Level::TRACE).with_test_writer().finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut tracker = ClaimTracker::new();
            tracker.claim().unwrap();
            match tracker.claim() {
                Err(BodyError::AlreadyClaimed { claimed_at: Some(location) }) => {
                    assert_eq!(location.file(), file!());
                }
                other => panic!("unexpected claim result: {:?}", other),
            }
        });
    }
}
