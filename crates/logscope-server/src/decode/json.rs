//! log4j `JsonLayout` events
//!
//! Accepts both the "complete" layout, where events are wrapped in a JSON
//! array and separated by commas, and the fragment layout with one bare
//! object per event.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

use logscope_types::{LogLevel, LogRecord, StackFrame, ThrowableInfo};

use super::{DecoderFactory, Next, Probe, RecordDecoder};
use crate::error::DecodeError;
use crate::sniff::{SniffStream, is_timeout};

/// Claims streams whose first non-whitespace byte opens an object or array
#[derive(Debug, Default)]
pub struct JsonDecoderFactory;

impl DecoderFactory for JsonDecoderFactory {
    fn name(&self) -> &'static str {
        "json"
    }

    fn probe(&self, mut stream: SniffStream) -> Probe {
        let claimed = match stream.peek_significant(1) {
            Ok(prefix) => matches!(prefix.first(), Some(b'{' | b'[')),
            Err(e) => {
                trace!(error = %e, "JSON probe failed");
                false
            }
        };

        if claimed {
            Probe::Claimed(Box::new(JsonDecoder::new(stream)))
        } else {
            Probe::Declined(stream)
        }
    }
}

/// Decodes one `JsonLayout` event at a time
///
/// Objects are only consumed once completely buffered, so a read timeout in
/// the middle of an event loses nothing.
#[derive(Debug)]
pub struct JsonDecoder {
    stream: SniffStream,
    scanner: ObjectScanner,
}

impl JsonDecoder {
    pub fn new(stream: SniffStream) -> Self {
        Self {
            stream,
            scanner: ObjectScanner::default(),
        }
    }
}

impl RecordDecoder for JsonDecoder {
    fn next_record(&mut self) -> Result<Next, DecodeError> {
        loop {
            if let Some((start, end)) = self.scanner.scan(self.stream.buffered())? {
                let event: JsonEvent = serde_json::from_slice(&self.stream.buffered()[start..end])?;
                self.stream.consume(end);
                return Ok(Next::Record(event.into_record()));
            }

            match self.stream.fill_more() {
                Ok(0) => {
                    return match self.scanner.pending(self.stream.buffered()) {
                        0 => Ok(Next::EndOfStream),
                        pending => Err(DecodeError::Truncated { pending }),
                    };
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(Next::TimedOut),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Finds the extent of the next top-level object in a growing buffer
///
/// Scanning resumes where it stopped, so each byte is examined once even when
/// an object arrives across many reads.
#[derive(Debug, Default)]
struct ObjectScanner {
    /// Next byte to examine
    cursor: usize,

    /// Offset of the opening brace of the object in progress
    start: Option<usize>,

    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ObjectScanner {
    /// Returns the `[start, end)` span of the first complete object
    ///
    /// After a span is returned the scanner starts over, so the caller must
    /// consume up to `end` before scanning again.
    fn scan(&mut self, data: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
        while self.cursor < data.len() {
            let byte = data[self.cursor];
            self.cursor += 1;

            let Some(start) = self.start else {
                match byte {
                    b'{' => {
                        self.start = Some(self.cursor - 1);
                        self.depth = 1;
                    }
                    b'[' | b']' | b',' => {}
                    b if b.is_ascii_whitespace() => {}
                    other => {
                        return Err(DecodeError::Malformed(format!(
                            "unexpected byte 0x{other:02x} between JSON events"
                        )));
                    }
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let span = (start, self.cursor);
                        *self = Self::default();
                        return Ok(Some(span));
                    }
                }
                _ => {}
            }
        }

        Ok(None)
    }

    /// Bytes belonging to an incomplete object
    fn pending(&self, data: &[u8]) -> usize {
        self.start.map_or(0, |start| data.len() - start)
    }
}

// =============================================================================
// JsonLayout schema
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonEvent {
    instant: Option<JsonInstant>,
    time_millis: Option<i64>,
    level: Option<String>,
    logger_name: Option<String>,
    message: Option<String>,
    thread: Option<String>,
    thrown: Option<JsonThrown>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonInstant {
    epoch_second: i64,
    #[serde(default)]
    nano_of_second: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonThrown {
    name: Option<String>,
    message: Option<String>,
    localized_message: Option<String>,
    #[serde(default, alias = "stackTrace")]
    extended_stack_trace: Vec<JsonFrame>,
    cause: Option<Box<JsonThrown>>,
}

#[derive(Debug, Deserialize)]
struct JsonFrame {
    #[serde(default)]
    class: String,
    #[serde(default)]
    method: String,
    file: Option<String>,
    line: Option<i64>,
}

impl JsonEvent {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match (&self.instant, self.time_millis) {
            (Some(instant), _) => DateTime::from_timestamp(instant.epoch_second, instant.nano_of_second),
            (None, Some(millis)) => DateTime::from_timestamp_millis(millis),
            (None, None) => None,
        }
    }

    fn into_record(self) -> LogRecord {
        let timestamp = self.timestamp().unwrap_or_else(Utc::now);
        let level = self
            .level
            .as_deref()
            .and_then(LogLevel::parse)
            .unwrap_or_default();

        LogRecord {
            timestamp,
            level,
            logger_name: self.logger_name,
            message: self.message.unwrap_or_default(),
            thread: self.thread,
            thrown: self.thrown.map(JsonThrown::into_info),
        }
    }
}

impl JsonThrown {
    fn into_info(self) -> ThrowableInfo {
        ThrowableInfo {
            name: self.name.unwrap_or_default(),
            message: self.message.or(self.localized_message),
            frames: self
                .extended_stack_trace
                .into_iter()
                .map(|f| StackFrame {
                    class_name: f.class,
                    method: f.method,
                    file: f.file,
                    line: f.line,
                })
                .collect(),
            cause: self.cause.map(|c| Box::new(c.into_info())),
        }
    }
}
