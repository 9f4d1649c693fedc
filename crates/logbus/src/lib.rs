//! Chakrator log broadcaster: fans reconcile log records out to live
//! subscribers (web clients, tests) and mirrors them into `tracing`.
//!
//! Publishing never blocks. A subscriber that falls further behind than the
//! channel capacity loses its oldest records instead of slowing producers.

#![forbid(unsafe_code)]

use chakrator_core::{LogLevel, LogRecord, LogSink};
use futures::Stream;
use metrics::counter;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 1024;

const TARGET: &str = "chakrator::reconcile";

/// Cloneable handle; all clones publish into the same channel.
#[derive(Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogRecord>,
    mirror: bool,
}

impl Default for LogBroadcaster {
    fn default() -> Self { Self::new(DEFAULT_CAPACITY) }
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx, mirror: true }
    }

    /// Disable mirroring into `tracing` (keeps test output quiet).
    pub fn without_mirror(mut self) -> Self {
        self.mirror = false;
        self
    }

    pub fn publish(&self, record: LogRecord) {
        if self.mirror {
            mirror(&record);
        }
        counter!("logbus_published_total", 1u64, "level" => record.level.as_str());
        // Err only means nobody is listening right now.
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        debug!(subscriber = %id, active = self.tx.receiver_count() + 1, "log subscriber attached");
        Subscription { id, rx: self.tx.subscribe(), dropped: 0 }
    }

    pub fn subscriber_count(&self) -> usize { self.tx.receiver_count() }
}

impl LogSink for LogBroadcaster {
    fn emit(&self, record: LogRecord) { self.publish(record) }
}

fn mirror(record: &LogRecord) {
    match record.level {
        LogLevel::Error => error!(target: TARGET, "{}", record.message),
        LogLevel::Warn => warn!(target: TARGET, "{}", record.message),
        LogLevel::Info | LogLevel::Success => info!(target: TARGET, "{}", record.message),
        LogLevel::Debug | LogLevel::Separator => debug!(target: TARGET, "{}", record.message),
    }
}

/// A registered subscriber. Dropping it deregisters.
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<LogRecord>,
    dropped: u64,
}

impl Subscription {
    pub fn id(&self) -> Uuid { self.id }

    /// Records this subscriber lost by lagging behind.
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Next record; `None` once every broadcaster handle is gone.
    pub async fn recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<LogRecord> {
        loop {
            match self.rx.try_recv() {
                Ok(record) => return Some(record),
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = LogRecord> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move { sub.recv().await.map(|r| (r, sub)) })
    }

    fn note_lag(&mut self, n: u64) {
        self.dropped = self.dropped.saturating_add(n);
        counter!("logbus_dropped_total", n);
        warn!(subscriber = %self.id, missed = n, "log subscriber lagged; records dropped");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(subscriber = %self.id, dropped = self.dropped, "log subscriber detached");
    }
}
