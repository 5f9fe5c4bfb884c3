use std::fmt;

/// Policy reconciling the consumption rates of the two halves of a split body.
///
/// The same taxonomy is used by the push model ([`UpstreamBalancer`](crate::flow::UpstreamBalancer))
/// and the pull model ([`StreamPair`](crate::blocking::StreamPair)).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackpressureMode {
    /// Consume at the rate of the slower side. Nothing is ever queued.
    Slowest,
    /// Consume at the rate of the faster side, queueing data for the slower one.
    Fastest,
    /// Consume at the rate of the original body, the new one just listens.
    Original,
    /// Consume at the rate of the new body, the original one just listens.
    New,
}

impl BackpressureMode {
    /// The side whose rate drives upstream in the mirror modes
    pub(crate) fn preferred(self) -> Option<Side> {
        match self {
            BackpressureMode::Original => Some(Side::Left),
            BackpressureMode::New => Some(Side::Right),
            BackpressureMode::Slowest | BackpressureMode::Fastest => None,
        }
    }
}

/// One of the two ends produced by a split. `Left` stays with the original body, `Right` is
/// handed to the new one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    #[inline]
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    #[inline]
    pub(crate) const fn bit(self) -> u8 {
        match self {
            Side::Left => 0b01,
            Side::Right => 0b10,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}
