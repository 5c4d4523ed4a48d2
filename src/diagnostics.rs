//! In-memory diagnostics log
//!
//! Every `accent` log record at or above the diagnostics level is formatted as
//! `HH:MM:SS component [LEVEL]: message` and kept in a bounded ring, newest
//! first, so a debug view can show recent activity without reading stderr.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

const CRATE_TARGET: &str = "accent";

/// Shared handle to the diagnostics ring
#[derive(Clone)]
pub struct Diagnostics {
    inner: Arc<Mutex<Ring>>,
}

struct Ring {
    entries: VecDeque<String>,
    capacity: usize,
    level: LevelFilter,
}

impl Diagnostics {
    pub fn new(capacity: usize, level: LevelFilter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
                level,
            })),
        }
    }

    /// Map the `debug_level` setting onto a filter: 0 none, 1 info, 2 debug.
    pub fn level_for(debug_level: u8) -> LevelFilter {
        match debug_level {
            0 => LevelFilter::Off,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.inner.lock().level
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.inner.lock().level = level;
    }

    fn accepts(&self, metadata: &Metadata<'_>) -> bool {
        metadata.target().starts_with(CRATE_TARGET) && metadata.level() <= self.level()
    }

    pub fn record(&self, record: &Record<'_>) {
        if !self.accepts(record.metadata()) {
            return;
        }
        let component = record
            .target()
            .strip_prefix("accent::")
            .unwrap_or(record.target());
        let entry = format!(
            "{} {} [{}]: {}",
            chrono::Local::now().format("%H:%M:%S"),
            component,
            record.level(),
            record.args()
        );

        let mut ring = self.inner.lock();
        if ring.capacity == 0 {
            return;
        }
        ring.entries.push_front(entry);
        let capacity = ring.capacity;
        ring.entries.truncate(capacity);
    }

    /// Entries, newest first
    pub fn entries(&self) -> Vec<String> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

/// Logger that writes through `env_logger` and also feeds [`Diagnostics`]
pub struct DiagnosticsLog {
    console: env_logger::Logger,
    diagnostics: Diagnostics,
}

impl DiagnosticsLog {
    pub fn new(console: env_logger::Logger, diagnostics: Diagnostics) -> Self {
        Self {
            console,
            diagnostics,
        }
    }

    /// Most verbose level either sink wants
    pub fn max_level(&self) -> LevelFilter {
        self.console.filter().max(self.diagnostics.level())
    }
}

impl Log for DiagnosticsLog {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.console.enabled(metadata) || self.diagnostics.accepts(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        self.diagnostics.record(record);
    }

    fn flush(&self) {
        self.console.flush();
    }
}
