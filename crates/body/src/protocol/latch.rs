use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::Side;

const BOTH: u8 = Side::Left.bit() | Side::Right.bit();

/// Two-bit join latch: an action is only passed on once both sides of a split asked for it.
///
/// [`JoinLatch::set`] reports `true` exactly once, to the call that completed the pair.
/// Repeated calls from the same side are ignored.
#[derive(Debug, Default)]
pub struct JoinLatch {
    bits: AtomicU8,
}

impl JoinLatch {
    pub const fn new() -> Self {
        Self { bits: AtomicU8::new(0) }
    }

    pub fn set(&self, side: Side) -> bool {
        let old = self.bits.fetch_or(side.bit(), Ordering::AcqRel);
        old != BOTH && old | side.bit() == BOTH
    }

    #[inline]
    pub fn is_set(&self, side: Side) -> bool {
        self.bits.load(Ordering::Acquire) & side.bit() != 0
    }

    #[inline]
    pub fn is_joined(&self) -> bool {
        self.bits.load(Ordering::Acquire) == BOTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn joins_once() {
        let latch = JoinLatch::new();
        assert!(!latch.set(Side::Left));
        assert!(!latch.set(Side::Left));
        assert!(latch.is_set(Side::Left));
        assert!(!latch.is_joined());

        assert!(latch.set(Side::Right));
        assert!(latch.is_joined());

        assert!(!latch.set(Side::Right));
        assert!(!latch.set(Side::Left));
    }

    #[test]
    fn concurrent_join_reports_once() {
        for _ in 0..100 {
            let latch = Arc::new(JoinLatch::new());
            let handles: Vec<_> = [Side::Left, Side::Right]
                .into_iter()
                .map(|side| {
                    let latch = Arc::clone(&latch);
                    thread::spawn(move || latch.set(side))
                })
                .collect();

            let joined = handles.into_iter().map(|h| h.join().unwrap()).filter(|joined| *joined).count();
            assert_eq!(joined, 1);
        }
    }
}
