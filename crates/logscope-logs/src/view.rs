use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use logscope_types::{ListenerSet, LogLevel, SharedRecord};

use crate::buffer::RingBuffer;
use crate::error::BufferError;
use crate::filter::LogFilter;

/// How a single `put` changed the visible records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewUpdate {
    /// The record did not pass the filter
    None,

    /// The record was appended and the visible count grew
    Inserted,

    /// The record was appended and the oldest visible record was evicted
    Slid,
}

/// Change notification published to view listeners
#[derive(Clone, Debug)]
pub enum ViewChange {
    Inserted(SharedRecord),
    Slid(SharedRecord),

    /// Visible records were rebuilt or cleared; re-read everything
    Reset,
}

/// Callback receiving view changes
pub type ViewListener = dyn Fn(&ViewChange) + Send + Sync;

struct ViewState {
    /// Every ingested record
    raw: RingBuffer<SharedRecord>,

    /// Records passing `filter`, in arrival order
    filtered: RingBuffer<SharedRecord>,

    filter: LogFilter,
}

/// Raw and filtered record buffers plus the active filter, behind one lock
///
/// Reads always address the filtered buffer. Listeners are invoked after the
/// lock has been released.
pub struct LiveView {
    state: RwLock<ViewState>,
    listeners: ListenerSet<ViewListener>,
}

impl LiveView {
    /// Create an empty view whose buffers each hold `capacity` records
    pub fn new(capacity: usize, filter: LogFilter) -> Result<Self, BufferError> {
        Ok(Self {
            state: RwLock::new(ViewState {
                raw: RingBuffer::new(capacity)?,
                filtered: RingBuffer::new(capacity)?,
                filter,
            }),
            listeners: ListenerSet::new(),
        })
    }

    pub fn add_listener(&self, listener: &Arc<ViewListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<ViewListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Ingest a record
    pub fn put(&self, record: impl Into<SharedRecord>) -> ViewUpdate {
        let record = record.into();

        let update = {
            let mut state = self.state.write();
            state.raw.put(Arc::clone(&record));

            if !state.filter.matches(&record) {
                ViewUpdate::None
            } else if state.filtered.put(Arc::clone(&record)).is_some() {
                ViewUpdate::Slid
            } else {
                ViewUpdate::Inserted
            }
        };

        match update {
            ViewUpdate::None => {}
            ViewUpdate::Inserted => self.notify(&ViewChange::Inserted(record)),
            ViewUpdate::Slid => self.notify(&ViewChange::Slid(record)),
        }

        update
    }

    /// Replace the active filter and rebuild the visible records from the raw buffer
    pub fn set_filter(&self, filter: LogFilter) {
        {
            let mut state = self.state.write();
            let ViewState { raw, filtered, .. } = &mut *state;

            filtered.clear();
            for record in raw.iter().filter(|r| filter.matches(r)) {
                filtered.put(Arc::clone(record));
            }
            state.filter = filter;

            debug!(
                raw = state.raw.len(),
                visible = state.filtered.len(),
                "Rebuilt filtered view"
            );
        }

        self.notify(&ViewChange::Reset);
    }

    /// Drop every record
    pub fn clear(&self) {
        {
            let mut state = self.state.write();
            state.raw.clear();
            state.filtered.clear();
        }

        self.notify(&ViewChange::Reset);
    }

    /// Copy of the active filter
    pub fn filter(&self) -> LogFilter {
        self.state.read().filter.clone()
    }

    /// Number of visible records
    pub fn len(&self) -> usize {
        self.state.read().filtered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().filtered.is_empty()
    }

    /// Visible record at `index`, where 0 is the oldest
    pub fn get(&self, index: usize) -> Result<SharedRecord, BufferError> {
        self.state.read().filtered.get(index).map(Arc::clone)
    }

    /// All visible records, oldest first
    pub fn snapshot(&self) -> Vec<SharedRecord> {
        self.state.read().filtered.iter().map(Arc::clone).collect()
    }

    /// Visit every visible record under the read lock
    pub fn for_each(&self, mut f: impl FnMut(&SharedRecord)) {
        let state = self.state.read();
        for record in state.filtered.iter() {
            f(record);
        }
    }

    /// Count visible records per level
    pub fn level_counts(&self) -> LevelCounts {
        let mut counts = LevelCounts::default();
        self.for_each(|record| counts.record(record.level));
        counts
    }

    fn notify(&self, change: &ViewChange) {
        self.listeners.for_each(|listener| listener(change));
    }
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub trace: usize,
    pub debug: usize,
    pub info: usize,
    pub warn: usize,
    pub error: usize,
    pub fatal: usize,
}

impl LevelCounts {
    fn record(&mut self, level: LogLevel) {
        match level {
            LogLevel::Trace => self.trace += 1,
            LogLevel::Debug => self.debug += 1,
            LogLevel::Info => self.info += 1,
            LogLevel::Warn => self.warn += 1,
            LogLevel::Error => self.error += 1,
            LogLevel::Fatal => self.fatal += 1,
        }
    }

    pub fn get(&self, level: LogLevel) -> usize {
        match level {
            LogLevel::Trace => self.trace,
            LogLevel::Debug => self.debug,
            LogLevel::Info => self.info,
            LogLevel::Warn => self.warn,
            LogLevel::Error => self.error,
            LogLevel::Fatal => self.fatal,
        }
    }

    pub fn total(&self) -> usize {
        self.trace + self.debug + self.info + self.warn + self.error + self.fatal
    }
}
