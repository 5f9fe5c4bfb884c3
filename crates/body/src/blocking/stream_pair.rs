use std::fmt;
use std::io::{self, Read};
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::blocking::stream::cancelled;
use crate::blocking::{BlockingStream, ByteQueue};
use crate::protocol::{BackpressureMode, BodyError, JoinLatch, Side};

/// Hand-over slot of the slowest mode: one side waits, the other reads for both.
enum Rendezvous {
    Idle,
    Waiting { side: Side, len: usize },
    Filled { side: Side, data: Bytes },
}

impl Rendezvous {
    fn is_waiting(&self, side: Side) -> bool {
        matches!(self, Rendezvous::Waiting { side: waiting, .. } if *waiting == side)
    }

    fn waiter(&self) -> Option<(Side, usize)> {
        match self {
            Rendezvous::Waiting { side, len } => Some((*side, *len)),
            Rendezvous::Idle | Rendezvous::Filled { .. } => None,
        }
    }

    fn is_held_for(&self, side: Side) -> bool {
        match self {
            Rendezvous::Idle => false,
            Rendezvous::Waiting { side: held, .. } | Rendezvous::Filled { side: held, .. } => *held == side,
        }
    }
}

struct PairState {
    queue: ByteQueue,
    queued_for: Option<Side>,
    rendezvous: Rendezvous,
    eof: bool,
    failure: Option<BodyError>,
    /// The side currently reading upstream with the pair unlocked.
    reading: Option<Side>,
}

impl PairState {
    fn terminal(&self) -> Option<io::Result<usize>> {
        if let Some(e) = &self.failure {
            return Some(Err(e.clone().into()));
        }
        if self.eof {
            return Some(Ok(0));
        }
        None
    }

    /// Remembers end of stream and failures of an upstream read for both sides.
    fn record(&mut self, result: io::Result<usize>) -> io::Result<usize> {
        match result {
            Ok(0) => {
                trace!("upstream reached end of stream");
                self.eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                debug!(error = %e, "upstream read failed");
                let e = BodyError::io(e);
                self.failure = Some(e.clone());
                Err(e.into())
            }
        }
    }

    fn queue_for(&mut self, side: Side, bytes: &[u8]) {
        self.queue.add_copy(bytes);
        self.queued_for = Some(side);
    }

    fn take_queued(&mut self, side: Side, buf: &mut [u8]) -> Option<usize> {
        if self.queued_for != Some(side) {
            return None;
        }
        let n = self.queue.take(buf);
        if self.queue.is_empty() {
            self.queued_for = None;
        }
        Some(n)
    }

    fn collect(&mut self, side: Side, buf: &mut [u8]) -> Option<usize> {
        if !matches!(&self.rendezvous, Rendezvous::Filled { side: target, .. } if *target == side) {
            return None;
        }
        let Rendezvous::Filled { data, .. } = mem::replace(&mut self.rendezvous, Rendezvous::Idle) else {
            return None;
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Some(n)
    }
}

/// Splits one blocking upstream into two readers.
///
/// Each [`PairSide`] is meant to be driven by its own thread. One mutex and one condition
/// variable guard the whole pair. Upstream sits behind its own lock: the slowest mode reads it
/// with the pair locked, the other modes release the pair while reading so that the other side
/// can drain its queue meanwhile.
///
/// How the two readers are reconciled depends on the [`BackpressureMode`]:
///
/// - `Slowest`: a reader waits for the other one, then a single upstream read of the smaller of
///   the two requested lengths serves both. Nothing is queued.
/// - `Fastest`: whichever side is ahead reads upstream and queues a copy for the other side.
/// - `Original` / `New`: only the preferred side reads upstream, the listener receives queued
///   copies and waits while there are none. If the preferred side cancels, the listener reads
///   upstream itself.
///
/// `allow_discard` and `cancel_input` reach upstream once both sides asked for them.
pub struct StreamPair {
    mode: BackpressureMode,
    upstream: Mutex<Box<dyn BlockingStream>>,
    state: Mutex<PairState>,
    changed: Condvar,
    cancelled: JoinLatch,
    discarded: JoinLatch,
}

impl StreamPair {
    pub fn split(upstream: Box<dyn BlockingStream>, mode: BackpressureMode) -> (PairSide, PairSide) {
        let pair = Arc::new(StreamPair {
            mode,
            upstream: Mutex::new(upstream),
            state: Mutex::new(PairState {
                queue: ByteQueue::new(),
                queued_for: None,
                rendezvous: Rendezvous::Idle,
                eof: false,
                failure: None,
                reading: None,
            }),
            changed: Condvar::new(),
            cancelled: JoinLatch::new(),
            discarded: JoinLatch::new(),
        });
        trace!(?mode, "split blocking stream");
        (PairSide::new(Arc::clone(&pair), Side::Left), PairSide::new(pair, Side::Right))
    }

    #[inline]
    pub fn mode(&self) -> BackpressureMode {
        self.mode
    }

    fn read(&self, side: Side, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if let Some(preferred) = self.mode.preferred() {
            return self.read_mirrored(&mut state, side, preferred, buf);
        }
        match self.mode {
            BackpressureMode::Fastest => self.read_fastest(&mut state, side, buf),
            _ => self.read_slowest(&mut state, side, buf),
        }
    }

    fn read_locked(&self, state: &mut MutexGuard<'_, PairState>, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.upstream.lock().read(buf);
        state.record(result)
    }

    /// Reads upstream for `side` with the pair unlocked. Only one side reads at a time, the
    /// caller checks `reading` first.
    fn read_unlocked(&self, state: &mut MutexGuard<'_, PairState>, side: Side, buf: &mut [u8]) -> io::Result<usize> {
        state.reading = Some(side);
        let result = MutexGuard::unlocked(state, || self.upstream.lock().read(buf));
        state.reading = None;
        state.record(result)
    }

    fn read_slowest(&self, state: &mut MutexGuard<'_, PairState>, side: Side, buf: &mut [u8]) -> io::Result<usize> {
        let other = side.other();
        loop {
            if let Some(n) = state.collect(side, buf) {
                self.changed.notify_all();
                return Ok(n);
            }

            // the other side has not picked up its copy yet
            if matches!(state.rendezvous, Rendezvous::Filled { .. }) {
                self.changed.wait(state);
                continue;
            }

            if let Some(result) = state.terminal() {
                return result;
            }

            match state.rendezvous.waiter() {
                Some((waiting, len)) if waiting == other => {
                    let len = len.min(buf.len());
                    let result = self.read_locked(state, &mut buf[..len]);
                    match &result {
                        Ok(n) if *n > 0 => {
                            state.rendezvous = Rendezvous::Filled { side: other, data: Bytes::copy_from_slice(&buf[..*n]) };
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        _ => state.rendezvous = Rendezvous::Idle,
                    }
                    self.changed.notify_all();
                    return result;
                }
                Some(_) => {
                    return Err(io::Error::other(BodyError::illegal_state(format!("concurrent reads on the {side} side"))));
                }
                None if self.cancelled.is_set(other) => return self.read_locked(state, buf),
                None => {
                    state.rendezvous = Rendezvous::Waiting { side, len: buf.len() };
                    trace!(%side, len = buf.len(), "waiting for the other side");
                    while state.rendezvous.is_waiting(side) && !self.cancelled.is_set(other) {
                        self.changed.wait(state);
                    }
                    if state.rendezvous.is_waiting(side) {
                        trace!(%side, "other side cancelled, reading alone");
                        state.rendezvous = Rendezvous::Idle;
                    }
                }
            }
        }
    }

    fn read_fastest(&self, state: &mut MutexGuard<'_, PairState>, side: Side, buf: &mut [u8]) -> io::Result<usize> {
        let other = side.other();
        loop {
            if let Some(n) = state.take_queued(side, buf) {
                return Ok(n);
            }
            if let Some(result) = state.terminal() {
                return result;
            }
            if state.reading.is_some() {
                self.changed.wait(state);
                continue;
            }

            let result = self.read_unlocked(state, side, buf);
            if let Ok(n) = result
                && n > 0
                && !self.cancelled.is_set(other)
            {
                state.queue_for(other, &buf[..n]);
            }
            self.changed.notify_all();
            return result;
        }
    }

    fn read_mirrored(
        &self,
        state: &mut MutexGuard<'_, PairState>,
        side: Side,
        preferred: Side,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let listener = preferred.other();
        loop {
            if side == listener
                && let Some(n) = state.take_queued(side, buf)
            {
                return Ok(n);
            }
            if let Some(result) = state.terminal() {
                return result;
            }
            let may_read = side == preferred || self.cancelled.is_set(preferred);
            if !may_read || state.reading.is_some() {
                self.changed.wait(state);
                continue;
            }

            let result = self.read_unlocked(state, side, buf);
            if side == preferred
                && let Ok(n) = result
                && n > 0
                && !self.cancelled.is_set(listener)
            {
                state.queue_for(listener, &buf[..n]);
            }
            self.changed.notify_all();
            return result;
        }
    }

    fn allow_discard(&self, side: Side) {
        if self.discarded.set(side) {
            debug!("both sides allow discard, passing it upstream");
            self.upstream.lock().allow_discard();
        }
    }

    fn cancel(&self, side: Side) {
        let mut state = self.state.lock();
        let joined = self.cancelled.set(side);
        trace!(%side, "side cancelled");

        if state.queued_for == Some(side) {
            state.queue.clear();
            state.queued_for = None;
        }
        if state.rendezvous.is_held_for(side) {
            state.rendezvous = Rendezvous::Idle;
        }
        if joined {
            debug!("both sides cancelled, cancelling upstream");
            self.upstream.lock().cancel_input();
        }
        drop(state);
        self.changed.notify_all();
    }
}

impl fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPair")
            .field("mode", &self.mode)
            .field("cancelled", &self.cancelled)
            .field("discarded", &self.discarded)
            .finish_non_exhaustive()
    }
}

/// One reader of a [`StreamPair`]. Dropping it cancels its side.
#[derive(Debug)]
pub struct PairSide {
    pair: Arc<StreamPair>,
    side: Side,
    cancelled: bool,
}

impl PairSide {
    fn new(pair: Arc<StreamPair>, side: Side) -> Self {
        Self { pair, side, cancelled: false }
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub fn mode(&self) -> BackpressureMode {
        self.pair.mode()
    }
}

impl Read for PairSide {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancelled {
            return Err(cancelled());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.pair.read(self.side, buf)
    }
}

impl BlockingStream for PairSide {
    fn allow_discard(&mut self) {
        self.pair.allow_discard(self.side);
    }

    fn cancel_input(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.pair.cancel(self.side);
        }
    }
}

impl Drop for PairSide {
    fn drop(&mut self) {
        self.cancel_input();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::testing::{TestSource, pattern};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn split(source: TestSource, mode: BackpressureMode) -> (PairSide, PairSide) {
        StreamPair::split(Box::new(source), mode)
    }

    fn read_all(side: &mut PairSide, chunk: usize) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = vec![0; chunk];
        loop {
            match side.read(&mut buf)? {
                0 => return Ok(data),
                n => data.extend_from_slice(&buf[..n]),
            }
        }
    }

    fn wait_until_waiting(side: &PairSide, waiting: Side) {
        while !side.pair.state.lock().rendezvous.is_waiting(waiting) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_until_reading(side: &PairSide, reading: Side) {
        while side.pair.state.lock().reading != Some(reading) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_exact_vec(side: &mut PairSide, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        let n = side.read(&mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn slowest_delivers_identical_data() {
        let data = pattern(10_000);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(64), BackpressureMode::Slowest);

        let (from_left, from_right) = thread::scope(|s| {
            let left = s.spawn(|| read_all(&mut left, 7));
            let right = s.spawn(|| read_all(&mut right, 13));
            (left.join().unwrap().unwrap(), right.join().unwrap().unwrap())
        });

        assert_eq!(from_left, data);
        assert_eq!(from_right, data);
    }

    #[test]
    fn slowest_reads_at_most_the_smaller_request() {
        let data = pattern(100);
        let (mut left, mut right) = split(TestSource::new(data.clone()), BackpressureMode::Slowest);

        thread::scope(|s| {
            let waiting = s.spawn(|| read_exact_vec(&mut left, 10));
            wait_until_waiting(&right, Side::Left);

            let from_right = read_exact_vec(&mut right, 4);
            let from_left = waiting.join().unwrap();
            assert_eq!(from_right, data[..4]);
            assert_eq!(from_left, data[..4]);
        });
    }

    #[test]
    fn slowest_waiter_reads_alone_once_the_other_side_cancels() {
        let data = pattern(100);
        let source = TestSource::new(data.clone());
        let counters = source.counters();
        let (mut left, right) = split(source, BackpressureMode::Slowest);

        thread::scope(|s| {
            let waiting = s.spawn(|| read_exact_vec(&mut left, 8));
            wait_until_waiting(&right, Side::Left);
            drop(right);
            assert_eq!(waiting.join().unwrap(), data[..8]);
        });

        assert_eq!(read_all(&mut left, 16).unwrap(), data[8..]);
        assert_eq!(counters.cancels(), 0);
    }

    #[test]
    fn fastest_reader_never_waits() {
        let data = pattern(64);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(4), BackpressureMode::Fastest);

        assert_eq!(read_exact_vec(&mut left, 4), data[..4]);
        assert_eq!(read_exact_vec(&mut left, 4), data[4..8]);

        // the copies queued for the right side come first
        assert_eq!(read_exact_vec(&mut right, 16), data[..8]);
        // right is ahead now
        assert_eq!(read_exact_vec(&mut right, 16), data[8..12]);
        assert_eq!(read_exact_vec(&mut left, 16), data[8..12]);

        let (from_left, from_right) = thread::scope(|s| {
            let left = s.spawn(|| read_all(&mut left, 5));
            let right = s.spawn(|| read_all(&mut right, 9));
            (left.join().unwrap().unwrap(), right.join().unwrap().unwrap())
        });
        assert_eq!(from_left, data[12..]);
        assert_eq!(from_right, data[12..]);
    }

    #[test]
    fn fastest_keeps_queued_data_after_the_faster_side_cancels() {
        let data = pattern(32);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(4), BackpressureMode::Fastest);

        assert_eq!(read_exact_vec(&mut left, 4), data[..4]);
        left.cancel_input();

        assert_eq!(read_exact_vec(&mut right, 16), data[..4]);
        assert_eq!(read_exact_vec(&mut right, 16), data[4..8]);
        assert_eq!(read_all(&mut right, 16).unwrap(), data[8..]);
    }

    #[test]
    fn fastest_cancel_drops_own_queue() {
        let (mut left, mut right) = split(TestSource::new(pattern(32)), BackpressureMode::Fastest);

        assert_eq!(read_exact_vec(&mut left, 4).len(), 4);
        assert_eq!(left.pair.state.lock().queue.len(), 4);

        right.cancel_input();
        assert!(left.pair.state.lock().queue.is_empty());
        // nothing is queued for a side that is gone
        assert_eq!(read_exact_vec(&mut left, 4).len(), 4);
        assert!(left.pair.state.lock().queue.is_empty());
    }

    #[test]
    fn fastest_lagging_side_drains_while_upstream_blocks() {
        let data = pattern(16);
        let (release, gate) = mpsc::channel();
        let source = TestSource::new(data.clone()).max_read(4).gate_at(4, gate);
        let (mut left, mut right) = split(source, BackpressureMode::Fastest);

        assert_eq!(read_exact_vec(&mut left, 4), data[..4]);
        thread::scope(|s| {
            let blocked = s.spawn(|| read_exact_vec(&mut left, 4));
            wait_until_reading(&right, Side::Left);

            assert_eq!(read_exact_vec(&mut right, 16), data[..4]);
            release.send(()).unwrap();
            assert_eq!(blocked.join().unwrap(), data[4..8]);
        });
        assert_eq!(read_exact_vec(&mut right, 16), data[4..8]);
    }

    #[test]
    fn listener_drains_while_preferred_side_blocks() {
        let data = pattern(16);
        let (release, gate) = mpsc::channel();
        let source = TestSource::new(data.clone()).max_read(4).gate_at(4, gate);
        let (mut left, mut right) = split(source, BackpressureMode::Original);

        assert_eq!(read_exact_vec(&mut left, 4), data[..4]);
        thread::scope(|s| {
            let blocked = s.spawn(|| read_exact_vec(&mut left, 4));
            wait_until_reading(&right, Side::Left);

            assert_eq!(read_exact_vec(&mut right, 16), data[..4]);
            release.send(()).unwrap();
            assert_eq!(blocked.join().unwrap(), data[4..8]);
        });
        assert_eq!(read_exact_vec(&mut right, 16), data[4..8]);
    }

    #[test]
    fn original_listener_mirrors_preferred_side() {
        let data = pattern(5_000);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(100), BackpressureMode::Original);

        assert_eq!(read_exact_vec(&mut left, 5), data[..5]);
        assert_eq!(read_exact_vec(&mut right, 10), data[..5]);

        let (from_left, from_right) = thread::scope(|s| {
            let right = s.spawn(|| read_all(&mut right, 33));
            let left = s.spawn(|| read_all(&mut left, 50));
            (left.join().unwrap().unwrap(), right.join().unwrap().unwrap())
        });
        assert_eq!(from_left, data[5..]);
        assert_eq!(from_right, data[5..]);
    }

    #[test]
    fn listener_takes_over_when_preferred_side_cancels() {
        let data = pattern(50);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(3), BackpressureMode::Original);

        thread::scope(|s| {
            let listener = s.spawn(|| read_all(&mut right, 16).unwrap());
            assert_eq!(read_exact_vec(&mut left, 16), data[..3]);
            drop(left);
            assert_eq!(listener.join().unwrap(), data);
        });
    }

    #[test]
    fn new_prefers_right_side() {
        let data = pattern(20);
        let (mut left, mut right) = split(TestSource::new(data.clone()).max_read(5), BackpressureMode::New);

        assert_eq!(read_exact_vec(&mut right, 16), data[..5]);
        assert_eq!(read_exact_vec(&mut left, 16), data[..5]);
    }

    #[test]
    fn upstream_failure_reaches_both_sides() {
        let data = pattern(32);
        let source = TestSource::new(data.clone()).max_read(4).fail_at(6);
        let (mut left, mut right) = split(source, BackpressureMode::Fastest);

        assert_eq!(read_exact_vec(&mut left, 16), data[..4]);
        assert_eq!(read_exact_vec(&mut left, 16), data[4..6]);
        assert_eq!(left.read(&mut [0; 16]).unwrap_err().kind(), io::ErrorKind::ConnectionReset);
        // the failure is sticky
        assert_eq!(left.read(&mut [0; 16]).unwrap_err().kind(), io::ErrorKind::ConnectionReset);

        // queued data is delivered before the failure
        assert_eq!(read_exact_vec(&mut right, 16), data[..6]);
        assert_eq!(right.read(&mut [0; 16]).unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn discard_and_cancel_need_both_sides() {
        let source = TestSource::new(pattern(8));
        let counters = source.counters();
        let (mut left, mut right) = split(source, BackpressureMode::Slowest);

        left.allow_discard();
        left.allow_discard();
        assert_eq!(counters.discards(), 0);
        right.allow_discard();
        assert_eq!(counters.discards(), 1);
        right.allow_discard();
        assert_eq!(counters.discards(), 1);

        drop(left);
        assert_eq!(counters.cancels(), 0);
        right.cancel_input();
        right.cancel_input();
        assert_eq!(counters.cancels(), 1);
        drop(right);
        assert_eq!(counters.cancels(), 1);
    }

    #[test]
    fn cancelled_side_cannot_read() {
        let (mut left, mut right) = split(TestSource::new(pattern(8)), BackpressureMode::Fastest);

        left.cancel_input();
        assert_eq!(left.read(&mut [0; 4]).unwrap_err().kind(), io::ErrorKind::BrokenPipe);

        assert_eq!(right.read(&mut []).unwrap(), 0);
        assert_eq!(read_all(&mut right, 3).unwrap(), pattern(8));
    }
}
