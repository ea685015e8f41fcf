//! Log processing for logscope
//!
//! This crate provides the bounded record buffers, the per-field filter
//! engine, and the filtered live view consumed by the display layer.

mod buffer;
mod error;
mod filter;
mod view;

pub use buffer::RingBuffer;
pub use error::{BufferError, FilterError};
pub use filter::{FilterSettings, LogFilter, PropertyFilter, PropertyFilterSettings};
pub use view::{LevelCounts, LiveView, ViewChange, ViewListener, ViewUpdate};

// Re-export types used in our public API
pub use logscope_types::{LogField, LogLevel, LogRecord, SharedRecord};
