use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::flow::{BufferConsumer, Upstream};
use crate::protocol::BodyError;

/// Upstream that only counts what it is told.
#[derive(Debug, Default)]
pub(crate) struct RecordingUpstream {
    demand: AtomicU64,
    starts: AtomicUsize,
    discards: AtomicUsize,
    disregards: AtomicUsize,
}

impl RecordingUpstream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn demand(&self) -> u64 {
        self.demand.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub(crate) fn disregards(&self) -> usize {
        self.disregards.load(Ordering::SeqCst)
    }
}

impl Upstream for RecordingUpstream {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_bytes_consumed(&self, bytes_consumed: u64) {
        let _ = self.demand.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_add(bytes_consumed)));
    }

    fn allow_discard(&self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }

    fn disregard_backpressure(&self) {
        self.disregards.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Chunk(Bytes),
    Complete,
    Error(BodyError),
}

/// Consumer that appends everything it receives to a shared log.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingConsumer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingConsumer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub(crate) fn data(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Chunk(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn last(&self) -> Option<Event> {
        self.events.lock().last().cloned()
    }
}

impl BufferConsumer<Bytes> for RecordingConsumer {
    fn add(&mut self, chunk: Bytes) {
        self.events.lock().push(Event::Chunk(chunk));
    }

    fn complete(&mut self) {
        self.events.lock().push(Event::Complete);
    }

    fn error(&mut self, e: BodyError) {
        self.events.lock().push(Event::Error(e));
    }
}
