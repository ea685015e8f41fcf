//! log4j `XmlLayout` events
//!
//! The complete layout wraps events in an XML declaration and an `<Events>`
//! root element; the fragment layout sends bare `<Event>` elements. Both are
//! decoded by cutting out one `<Event>...</Event>` element at a time and
//! skipping whatever surrounds it.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::trace;

use logscope_types::{LogLevel, LogRecord, StackFrame, ThrowableInfo};

use super::{DecoderFactory, Next, Probe, RecordDecoder};
use crate::error::DecodeError;
use crate::sniff::{SniffStream, is_timeout};

const START_TAG: &[u8] = b"<Event";
const END_TAG: &[u8] = b"</Event>";

/// Claims streams opening with an XML declaration or an `<Event` element
#[derive(Debug, Default)]
pub struct XmlDecoderFactory;

impl DecoderFactory for XmlDecoderFactory {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn probe(&self, mut stream: SniffStream) -> Probe {
        let claimed = match stream.peek_significant(START_TAG.len()) {
            Ok(prefix) => prefix.starts_with(b"<?xml") || prefix.starts_with(START_TAG),
            Err(e) => {
                trace!(error = %e, "XML probe failed");
                false
            }
        };

        if claimed {
            Probe::Claimed(Box::new(XmlDecoder::new(stream)))
        } else {
            Probe::Declined(stream)
        }
    }
}

/// Decodes one `XmlLayout` event at a time
///
/// Like the JSON decoder, an element is only consumed once its closing tag
/// is buffered.
#[derive(Debug)]
pub struct XmlDecoder {
    stream: SniffStream,
    scanner: ElementScanner,
}

impl XmlDecoder {
    pub fn new(stream: SniffStream) -> Self {
        Self {
            stream,
            scanner: ElementScanner::default(),
        }
    }
}

impl RecordDecoder for XmlDecoder {
    fn next_record(&mut self) -> Result<Next, DecodeError> {
        loop {
            if let Some((start, end)) = self.scanner.scan(self.stream.buffered()) {
                let element = std::str::from_utf8(&self.stream.buffered()[start..end])
                    .map_err(|e| DecodeError::Malformed(format!("XML event is not UTF-8: {e}")))?;
                let event: XmlEvent = quick_xml::de::from_str(element)?;
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

/// Finds the next `<Event>` element in a growing buffer
///
/// Bytes before the element, such as the XML declaration or the `<Events>`
/// wrapper, are skipped and consumed along with it.
#[derive(Debug, Default)]
struct ElementScanner {
    /// Next offset to search from
    cursor: usize,

    /// Offset of the start tag of the element in progress
    start: Option<usize>,
}

impl ElementScanner {
    /// Returns the `[start, end)` span of the first complete element
    ///
    /// The caller must consume up to `end` before scanning again.
    fn scan(&mut self, data: &[u8]) -> Option<(usize, usize)> {
        let start = match self.start {
            Some(start) => start,
            None => match find_start_tag(data, self.cursor) {
                StartTag::Found(at) => {
                    self.start = Some(at);
                    self.cursor = at + START_TAG.len();
                    at
                }
                StartTag::Partial(at) => {
                    self.cursor = at;
                    return None;
                }
                StartTag::Missing => {
                    self.cursor = data.len().saturating_sub(START_TAG.len()).max(self.cursor);
                    return None;
                }
            },
        };

        match find(&data[self.cursor..], END_TAG) {
            Some(at) => {
                let end = self.cursor + at + END_TAG.len();
                *self = Self::default();
                Some((start, end))
            }
            None => {
                self.cursor = data.len().saturating_sub(END_TAG.len()).max(self.cursor);
                None
            }
        }
    }

    /// Bytes belonging to an incomplete element
    fn pending(&self, data: &[u8]) -> usize {
        self.start.map_or(0, |start| data.len() - start)
    }
}

enum StartTag {
    Found(usize),

    /// `<Event` at the end of the buffer, the next byte decides
    Partial(usize),

    Missing,
}

/// Locate `<Event` as a whole tag name, so `<Events>` is passed over
fn find_start_tag(data: &[u8], from: usize) -> StartTag {
    let mut at = from;
    while let Some(offset) = find(&data[at..], START_TAG) {
        let tag = at + offset;
        match data.get(tag + START_TAG.len()) {
            Some(b) if b.is_ascii_whitespace() || *b == b'>' => {
                return StartTag::Found(tag);
            }
            Some(_) => at = tag + 1,
            None => return StartTag::Partial(tag),
        }
    }
    StartTag::Missing
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// XmlLayout schema
// =============================================================================

#[derive(Debug, Deserialize)]
struct XmlEvent {
    #[serde(rename = "@timeMillis")]
    time_millis: Option<i64>,
    #[serde(rename = "@level")]
    level: Option<String>,
    #[serde(rename = "@loggerName")]
    logger_name: Option<String>,
    #[serde(rename = "@thread")]
    thread: Option<String>,
    #[serde(rename = "Instant")]
    instant: Option<XmlInstant>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "Thrown")]
    thrown: Option<XmlThrown>,
}

#[derive(Debug, Deserialize)]
struct XmlInstant {
    #[serde(rename = "@epochSecond")]
    epoch_second: i64,
    #[serde(rename = "@nanoOfSecond", default)]
    nano_of_second: u32,
}

#[derive(Debug, Deserialize)]
struct XmlThrown {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@message")]
    message: Option<String>,
    #[serde(rename = "@localizedMessage")]
    localized_message: Option<String>,
    #[serde(rename = "ExtendedStackTrace", alias = "StackTrace")]
    stack_trace: Option<XmlStackTrace>,
    #[serde(rename = "Cause")]
    cause: Option<Box<XmlThrown>>,
}

#[derive(Debug, Default, Deserialize)]
struct XmlStackTrace {
    #[serde(rename = "ExtendedStackTraceItem", alias = "StackTraceElement", default)]
    frames: Vec<XmlFrame>,
}

#[derive(Debug, Deserialize)]
struct XmlFrame {
    #[serde(rename = "@class", default)]
    class: String,
    #[serde(rename = "@method", default)]
    method: String,
    #[serde(rename = "@file")]
    file: Option<String>,
    #[serde(rename = "@line")]
    line: Option<i64>,
}

impl XmlEvent {
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
            thrown: self.thrown.map(XmlThrown::into_info),
        }
    }
}

impl XmlThrown {
    fn into_info(self) -> ThrowableInfo {
        ThrowableInfo {
            name: self.name.unwrap_or_default(),
            message: self.message.or(self.localized_message),
            frames: self
                .stack_trace
                .unwrap_or_default()
                .frames
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
