//! Wire-format detection and decoding
//!
//! Each supported encoding is a [`DecoderFactory`] that inspects the leading
//! bytes of a connection and, if it recognizes them, binds a
//! [`RecordDecoder`] to the stream for the rest of the connection.

mod json;
mod text;
mod xml;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use logscope_types::LogRecord;

use crate::error::DecodeError;
use crate::sniff::SniffStream;

pub use json::{JsonDecoder, JsonDecoderFactory};
pub use text::{TextDecoder, TextDecoderFactory};
pub use xml::{XmlDecoder, XmlDecoderFactory};

/// Outcome of one decode attempt
#[derive(Debug)]
pub enum Next {
    Record(LogRecord),

    /// No complete record arrived within the read timeout
    TimedOut,

    /// The peer closed the stream cleanly
    EndOfStream,
}

/// Stateful decoder bound to a single connection
pub trait RecordDecoder: Send {
    fn next_record(&mut self) -> Result<Next, DecodeError>;
}

/// Outcome of offering a stream to a factory
pub enum Probe {
    Claimed(Box<dyn RecordDecoder>),

    /// The stream is handed back untouched
    Declined(SniffStream),
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claimed(_) => f.write_str("Claimed"),
            Self::Declined(stream) => f.debug_tuple("Declined").field(stream).finish(),
        }
    }
}

/// Recognizes one wire format
pub trait DecoderFactory: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Inspect the stream's leading bytes and claim or decline it
    ///
    /// Implementations may only peek; a declined stream must be returned
    /// with nothing consumed.
    fn probe(&self, stream: SniffStream) -> Probe;
}

/// Built-in wire formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// log4j `JsonLayout`
    Json,

    /// log4j `XmlLayout`
    Xml,

    /// Plain text lines, such as log4j `PatternLayout`
    Text,
}

impl WireFormat {
    /// Probe order used when none is configured
    pub const DEFAULT_ORDER: [WireFormat; 3] = [Self::Json, Self::Xml, Self::Text];

    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Text => "text",
        }
    }

    pub fn factory(self) -> Arc<dyn DecoderFactory> {
        match self {
            Self::Json => Arc::new(JsonDecoderFactory),
            Self::Xml => Arc::new(XmlDecoderFactory),
            Self::Text => Arc::new(TextDecoderFactory),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "xml" => Ok(Self::Xml),
            "text" | "plain" => Ok(Self::Text),
            other => Err(format!("unknown wire format '{other}' (expected json, xml or text)")),
        }
    }
}

/// Factories for `formats`, in order, with duplicates removed
pub fn factories(formats: &[WireFormat]) -> Vec<Arc<dyn DecoderFactory>> {
    let mut seen = Vec::with_capacity(formats.len());
    for format in formats {
        if !seen.contains(format) {
            seen.push(*format);
        }
    }
    seen.into_iter().map(WireFormat::factory).collect()
}
