//! Sequenced in-memory log ring.
//!
//! Every record gets a strictly increasing sequence number; the ring keeps
//! the most recent `capacity` entries and evicts oldest-first. Readers pull
//! records strictly after a sequence they already hold (`since`), which is
//! how the presentation process tails the daemon log over the control
//! socket. A [`LogBusLayer`] plugs the bus into `tracing` so every
//! `info!`/`warn!`/`error!` in the daemon lands in the ring.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Ring capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fetch limit applied when the caller passes 0.
pub const DEFAULT_FETCH_LIMIT: usize = 100;

/// One log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    /// Unix timestamp in milliseconds.
    pub time: i64,
    /// `info`, `warn` or `error`.
    pub level: String,
    pub message: String,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    capacity: usize,
    sink: Option<File>,
}

/// Bounded, sequenced log buffer. Cheap to clone via [`Arc`].
pub struct LogBus {
    inner: Mutex<Inner>,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
                capacity,
                sink: None,
            }),
        }
    }

    /// Attach an append-only file sink; every record is also written there.
    pub fn with_file_sink(self, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.inner.lock().expect("logbus poisoned").sink = Some(file);
        Ok(self)
    }

    /// Append a record: assign the next sequence, timestamp in milliseconds,
    /// evict the oldest entry when full.
    pub fn append(&self, level: &str, message: &str) {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut inner = self.inner.lock().expect("logbus poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            seq,
            time,
            level: level.to_string(),
            message: message.to_string(),
        });

        if let Some(sink) = inner.sink.as_mut() {
            let stamp = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
            let _ = writeln!(sink, "{stamp} [{}] {message}", level.to_uppercase());
        }
    }

    /// Entries with `seq > since`, in order, capped by `limit` (0 means
    /// [`DEFAULT_FETCH_LIMIT`]). The second value is the highest sequence in
    /// the returned batch, or the ring's high-water mark when nothing new
    /// exists, or `since` itself when the ring is empty.
    pub fn since(&self, since: u64, limit: usize) -> (Vec<LogEntry>, u64) {
        let limit = if limit == 0 { DEFAULT_FETCH_LIMIT } else { limit };
        let inner = self.inner.lock().expect("logbus poisoned");

        let Some(last) = inner.entries.back() else {
            return (Vec::new(), since);
        };
        let high_water = last.seq;

        let logs: Vec<LogEntry> = inner
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .take(limit)
            .cloned()
            .collect();

        match logs.last() {
            Some(last) => {
                let last_seq = last.seq;
                (logs, last_seq)
            }
            None => (logs, high_water),
        }
    }

    /// Highest sequence currently in the ring (0 when empty).
    pub fn last_seq(&self) -> u64 {
        self.inner
            .lock()
            .expect("logbus poisoned")
            .entries
            .back()
            .map(|e| e.seq)
            .unwrap_or(0)
    }
}

/// `tracing` layer that mirrors every event into a [`LogBus`].
pub struct LogBusLayer {
    bus: Arc<LogBus>,
}

impl LogBusLayer {
    pub fn new(bus: Arc<LogBus>) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for LogBusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = match *event.metadata().level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            _ => "info",
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus.append(level, visitor.rendered().trim());
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn rendered(&self) -> String {
        if self.fields.is_empty() {
            self.message.clone()
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}
