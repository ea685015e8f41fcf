//! Error types for buffering and filtering

use logscope_types::LogField;
use thiserror::Error;

/// Errors raised by [`RingBuffer`](crate::RingBuffer) and the live view
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Buffers must hold at least one record
    #[error("buffer capacity must be at least 1")]
    ZeroCapacity,

    /// Index outside `0..len`
    #[error("index {index} out of range for buffer of length {len}")]
    OutOfRange { index: usize, len: usize },
}

/// Errors raised while configuring a filter
#[derive(Error, Debug, Clone)]
pub enum FilterError {
    /// The pattern could not be compiled with the requested flags
    #[error("invalid pattern {pattern:?} for {field} filter: {source}")]
    InvalidPattern {
        field: LogField,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
