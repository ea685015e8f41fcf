//! Shared types for logscope
//!
//! This crate contains the decoded log record model and small utilities used
//! by both the ingestion server and the live view.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level, ordered from least to most severe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// All levels in ascending severity
    pub const ALL: [LogLevel; 6] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
    ];

    /// Parse a level name as emitted by log4j and most other loggers
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "trc" | "finest" => Some(Self::Trace),
            "debug" | "dbg" | "fine" => Some(Self::Debug),
            "info" | "inf" | "information" => Some(Self::Info),
            "warn" | "warning" | "wrn" => Some(Self::Warn),
            "error" | "err" | "severe" => Some(Self::Error),
            "fatal" | "critical" | "crit" | "panic" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a throwable's stack trace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub class_name: String,
    pub method: String,
    pub file: Option<String>,
    pub line: Option<i64>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}.{}", self.class_name, self.method)?;
        match (&self.file, self.line) {
            (Some(file), Some(line)) if line >= 0 => write!(f, "({file}:{line})"),
            (Some(file), _) => write!(f, "({file})"),
            _ => f.write_str("(Unknown Source)"),
        }
    }
}

/// Error detail attached to a log record, including its cause chain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThrowableInfo {
    /// Fully qualified class name of the throwable
    pub name: String,

    /// Throwable message (if any)
    pub message: Option<String>,

    /// Stack trace, innermost frame first
    pub frames: Vec<StackFrame>,

    /// Nested cause
    pub cause: Option<Box<ThrowableInfo>>,
}

impl ThrowableInfo {
    pub fn new(name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            message,
            frames: Vec::new(),
            cause: None,
        }
    }

    /// Iterate over this throwable and all of its causes
    pub fn chain(&self) -> impl Iterator<Item = &ThrowableInfo> {
        std::iter::successors(Some(self), |t| t.cause.as_deref())
    }

    /// `name: message` summary line
    pub fn summary(&self) -> String {
        match &self.message {
            Some(message) => format!("{}: {}", self.name, message),
            None => self.name.clone(),
        }
    }
}

/// A single decoded log record
///
/// Records are never mutated after decoding; buffers share them as
/// [`SharedRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// The moment the event occurred
    pub timestamp: DateTime<Utc>,

    /// Severity level
    pub level: LogLevel,

    /// Logger/category name
    pub logger_name: Option<String>,

    /// Formatted message
    pub message: String,

    /// Name of the thread that logged the event
    pub thread: Option<String>,

    /// Attached error detail
    pub thrown: Option<ThrowableInfo>,
}

/// Records as stored by buffers and handed to the display layer
pub type SharedRecord = Arc<LogRecord>;

impl LogRecord {
    /// Create a record with the given level and message, stamped now
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger_name: None,
            message: message.into(),
            thread: None,
            thrown: None,
        }
    }

    pub fn with_logger(mut self, logger_name: impl Into<String>) -> Self {
        self.logger_name = Some(logger_name.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_thrown(mut self, thrown: ThrowableInfo) -> Self {
        self.thrown = Some(thrown);
        self
    }

    /// Timestamp rendered in the local time zone (RFC 2822 / RFC 1123 style)
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.with_timezone(&Local).to_rfc2822()
    }
}

// ============================================================================
// Tracked Fields
// ============================================================================

/// Record properties that can be displayed and filtered on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogField {
    Timestamp,
    Level,
    Category,
    Message,
    Throwable,
}

impl LogField {
    /// Every tracked field, in column order
    pub const ALL: [LogField; 5] = [
        Self::Timestamp,
        Self::Level,
        Self::Category,
        Self::Message,
        Self::Throwable,
    ];

    /// Position of this field within [`LogField::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Self::Timestamp => "Timestamp",
            Self::Level => "Level",
            Self::Category => "Category",
            Self::Message => "Message",
            Self::Throwable => "Throwable",
        }
    }

    /// Text value of this field for the given record; absent values are empty
    pub fn value(self, record: &LogRecord) -> Cow<'_, str> {
        match self {
            Self::Timestamp => Cow::Owned(record.formatted_timestamp()),
            Self::Level => Cow::Borrowed(record.level.as_str()),
            Self::Category => Cow::Borrowed(record.logger_name.as_deref().unwrap_or("")),
            Self::Message => Cow::Borrowed(&record.message),
            Self::Throwable => Cow::Borrowed(if record.thrown.is_some() { "x" } else { "" }),
        }
    }
}

impl fmt::Display for LogField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Copy-on-read registry of callbacks keyed on `Arc` identity
///
/// Registering the same `Arc` twice has no effect. Dispatch happens on a
/// snapshot so callbacks never run while the registry lock is held.
pub struct ListenerSet<T: ?Sized> {
    listeners: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener; returns `false` if it was already registered
    pub fn add(&self, listener: &Arc<T>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        listeners.push(Arc::clone(listener));
        true
    }

    /// Unregister a listener; returns `false` if it was not registered
    pub fn remove(&self, listener: &Arc<T>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Current listeners
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.listeners.read().clone()
    }

    /// Invoke `f` for every listener registered at the time of the call
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for listener in self.snapshot() {
            f(&*listener);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}
