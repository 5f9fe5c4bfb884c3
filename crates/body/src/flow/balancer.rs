//! Lock-free fan-in of the backpressure signals of a split push-model body.
//!
//! Both halves of a split report consumption independently and concurrently. The balancer turns
//! those two signals into the single demand the shared upstream should see, according to the
//! [`BackpressureMode`]:
//!
//! - `Slowest`: cumulative demand is `min(left, right)`
//! - `Fastest`: cumulative demand is `max(left, right)`
//! - `Original` / `New`: the preferred side passes straight through; the other side's consumption
//!   is only recorded, and flushed once when that side disregards backpressure
//!
//! All state lives in one atomic word updated by compare-and-swap, plus [`JoinLatch`]es for the
//! boolean signals. No call ever blocks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, trace};

use crate::flow::Upstream;
use crate::protocol::{BackpressureMode, JoinLatch, Side};

/// Largest delta representable next to the flag bit
pub(crate) const MAX_DELTA: i64 = i64::MAX >> 1;
/// Smallest delta representable next to the flag bit
pub(crate) const MIN_DELTA: i64 = i64::MIN >> 1;

/// Clamping add over the delta range, never wraps
#[inline]
pub(crate) fn add_saturating(delta: i64, n: i64) -> i64 {
    delta.saturating_add(n).clamp(MIN_DELTA, MAX_DELTA)
}

/// Clamping subtract over the delta range, never wraps
#[inline]
pub(crate) fn subtract_saturating(delta: i64, n: i64) -> i64 {
    delta.saturating_sub(n).clamp(MIN_DELTA, MAX_DELTA)
}

#[inline]
fn clamp_amount(n: u64) -> i64 {
    i64::try_from(n).map_or(MAX_DELTA, |n| n.min(MAX_DELTA))
}

/// The atomic word: `delta << 1 | flushed`.
///
/// `delta` is left-consumed minus right-consumed. `flushed` is only used by the mirror modes and
/// marks that the ignoring side has disregarded backpressure and was flushed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct State {
    delta: i64,
    flushed: bool,
}

impl State {
    #[inline]
    fn unpack(word: i64) -> Self {
        Self { delta: word >> 1, flushed: word & 1 != 0 }
    }

    #[inline]
    fn pack(self) -> i64 {
        (self.delta << 1) | i64::from(self.flushed)
    }

    /// How far `side` is ahead of its counterpart
    #[inline]
    fn ahead(self, side: Side) -> i64 {
        match side {
            Side::Left => self.delta,
            Side::Right => -self.delta,
        }
    }

    #[inline]
    fn consume(self, side: Side, n: i64) -> Self {
        let delta = match side {
            Side::Left => add_saturating(self.delta, n),
            Side::Right => subtract_saturating(self.delta, n),
        };
        Self { delta, ..self }
    }
}

/// Shared state behind the two [`BalancedUpstream`] handles of one split.
pub struct UpstreamBalancer {
    upstream: Arc<dyn Upstream>,
    mode: BackpressureMode,
    word: AtomicI64,
    start: JoinLatch,
    discard: JoinLatch,
    disregard: JoinLatch,
}

impl UpstreamBalancer {
    /// Splits `upstream` into a left and a right handle balanced according to `mode`.
    pub fn pair(upstream: Arc<dyn Upstream>, mode: BackpressureMode) -> (BalancedUpstream, BalancedUpstream) {
        let balancer = Arc::new(UpstreamBalancer {
            upstream,
            mode,
            word: AtomicI64::new(State { delta: 0, flushed: false }.pack()),
            start: JoinLatch::new(),
            discard: JoinLatch::new(),
            disregard: JoinLatch::new(),
        });

        let left = BalancedUpstream { balancer: Arc::clone(&balancer), side: Side::Left };
        let right = BalancedUpstream { balancer, side: Side::Right };
        (left, right)
    }

    pub fn slowest(upstream: Arc<dyn Upstream>) -> (BalancedUpstream, BalancedUpstream) {
        Self::pair(upstream, BackpressureMode::Slowest)
    }

    pub fn fastest(upstream: Arc<dyn Upstream>) -> (BalancedUpstream, BalancedUpstream) {
        Self::pair(upstream, BackpressureMode::Fastest)
    }

    #[inline]
    pub fn mode(&self) -> BackpressureMode {
        self.mode
    }

    /// Current left-minus-right consumption difference.
    pub fn delta(&self) -> i64 {
        State::unpack(self.word.load(Ordering::Acquire)).delta
    }

    /// CAS loop applying `f` to the state. Returns the states before and after the update, or
    /// `None` when `f` declined to change anything.
    fn update<F>(&self, f: F) -> Option<(State, State)>
    where
        F: Fn(State) -> Option<State>,
    {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let old = State::unpack(current);
            let new = f(old)?;
            match self.word.compare_exchange_weak(current, new.pack(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some((old, new)),
                Err(actual) => current = actual,
            }
        }
    }

    fn forward(&self, side: Side, amount: u64) {
        if amount > 0 {
            trace!(%side, amount, mode = ?self.mode, "forward demand upstream");
            self.upstream.on_bytes_consumed(amount);
        }
    }

    fn on_bytes_consumed(&self, side: Side, bytes_consumed: u64) {
        if bytes_consumed == 0 {
            return;
        }
        let n = clamp_amount(bytes_consumed);
        match self.mode {
            BackpressureMode::Slowest | BackpressureMode::Fastest if self.disregard.is_set(side) => {}
            BackpressureMode::Slowest => self.consume_slowest(side, n),
            BackpressureMode::Fastest => self.consume_fastest(side, n),
            BackpressureMode::Original | BackpressureMode::New => {
                if Some(side) == self.mode.preferred() {
                    if !self.disregard.is_set(side) {
                        self.consume_preferred(side, n);
                    }
                } else {
                    self.consume_ignoring(side, n);
                }
            }
        }
    }

    /// Only the part of `n` that catches up with the other side extends the joint demand.
    fn consume_slowest(&self, side: Side, n: i64) {
        let Some((old, _)) = self.update(|state| Some(state.consume(side, n))) else {
            return;
        };
        let ahead = old.ahead(side);
        if ahead < 0 {
            self.forward(side, n.unsigned_abs().min(ahead.unsigned_abs()));
        }
    }

    /// Only the part by which this side now exceeds the other extends the joint demand.
    fn consume_fastest(&self, side: Side, n: i64) {
        let Some((old, new)) = self.update(|state| Some(state.consume(side, n))) else {
            return;
        };
        let granted = new.ahead(side).max(0) - old.ahead(side).max(0);
        self.forward(side, granted.unsigned_abs());
    }

    fn consume_preferred(&self, side: Side, n: i64) {
        let Some((old, new)) = self.update(|state| Some(state.consume(side, n))) else {
            return;
        };
        if old.flushed {
            // the ignoring side's flush already granted whatever it was ahead by
            let granted = new.ahead(side).max(0) - old.ahead(side).max(0);
            self.forward(side, granted.unsigned_abs());
        } else {
            self.forward(side, n.unsigned_abs());
        }
    }

    fn consume_ignoring(&self, side: Side, n: i64) {
        // recorded, never forwarded; ignored entirely once flushed
        self.update(|state| (!state.flushed).then(|| state.consume(side, n)));
    }

    fn flush_ignoring(&self, side: Side) {
        let Some((old, _)) = self.update(|state| (!state.flushed).then_some(State { flushed: true, ..state })) else {
            return;
        };
        let withheld = old.ahead(side).max(0);
        debug!(%side, withheld, "ignoring side disregards backpressure, flushing withheld demand");
        self.forward(side, withheld.unsigned_abs());
    }

    fn disregard_backpressure(&self, side: Side) {
        match self.mode {
            BackpressureMode::Slowest => {
                if self.disregard.is_set(side) {
                    return;
                }
                // no longer constraining: as if this side consumed everything
                self.consume_slowest(side, MAX_DELTA);
                self.join_disregard(side);
            }
            BackpressureMode::Fastest => self.join_disregard(side),
            BackpressureMode::Original | BackpressureMode::New => {
                if Some(side) == self.mode.preferred() {
                    if !self.disregard.is_set(side) {
                        self.disregard.set(side);
                        debug!(%side, "preferred side disregards backpressure");
                        self.upstream.disregard_backpressure();
                    }
                } else {
                    self.flush_ignoring(side);
                    self.disregard.set(side);
                }
            }
        }
    }

    fn join_disregard(&self, side: Side) {
        if self.disregard.set(side) {
            debug!(%side, mode = ?self.mode, "both sides disregard backpressure");
            self.upstream.disregard_backpressure();
        }
    }

    fn start(&self, side: Side) {
        if self.start.set(side) {
            debug!(mode = ?self.mode, "both sides started");
            self.upstream.start();
        }
    }

    fn allow_discard(&self, side: Side) {
        if self.discard.set(side) {
            debug!(mode = ?self.mode, "both sides allow discard");
            self.upstream.allow_discard();
        }
    }
}

impl fmt::Debug for UpstreamBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamBalancer")
            .field("mode", &self.mode)
            .field("state", &State::unpack(self.word.load(Ordering::Relaxed)))
            .field("start", &self.start)
            .field("discard", &self.discard)
            .field("disregard", &self.disregard)
            .finish_non_exhaustive()
    }
}

/// One side of a balanced split. Implements [`Upstream`] for the consumer of that side.
#[derive(Debug, Clone)]
pub struct BalancedUpstream {
    balancer: Arc<UpstreamBalancer>,
    side: Side,
}

impl BalancedUpstream {
    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn balancer(&self) -> &UpstreamBalancer {
        &self.balancer
    }
}

impl Upstream for BalancedUpstream {
    fn start(&self) {
        self.balancer.start(self.side);
    }

    fn on_bytes_consumed(&self, bytes_consumed: u64) {
        self.balancer.on_bytes_consumed(self.side, bytes_consumed);
    }

    fn allow_discard(&self) {
        self.balancer.allow_discard(self.side);
    }

    fn disregard_backpressure(&self) {
        self.balancer.disregard_backpressure(self.side);
    }
}
