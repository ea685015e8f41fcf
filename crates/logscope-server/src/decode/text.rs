//! Line-oriented plain text events

use chrono::{DateTime, Utc};
use tracing::trace;

use logscope_types::{LogLevel, LogRecord};

use super::{DecoderFactory, Next, Probe, RecordDecoder};
use crate::error::DecodeError;
use crate::sniff::{SniffStream, is_timeout};

/// Leading bytes inspected when probing
const PROBE_LEN: usize = 64;

/// Lines longer than this are split, at a character boundary
const MAX_LINE: usize = 64 * 1024;

/// Claims streams that start with printable UTF-8 text
///
/// Accepts almost anything textual, so it belongs last in the probe order.
#[derive(Debug, Default)]
pub struct TextDecoderFactory;

impl DecoderFactory for TextDecoderFactory {
    fn name(&self) -> &'static str {
        "text"
    }

    fn probe(&self, mut stream: SniffStream) -> Probe {
        let claimed = match stream.peek(PROBE_LEN) {
            Ok(prefix) => looks_like_text(prefix),
            Err(e) => {
                trace!(error = %e, "Text probe failed");
                false
            }
        };

        if claimed {
            Probe::Claimed(Box::new(TextDecoder::new(stream)))
        } else {
            Probe::Declined(stream)
        }
    }
}

/// Printable UTF-8, allowing a multi-byte character cut off at the end
fn looks_like_text(prefix: &[u8]) -> bool {
    if prefix.is_empty() {
        return false;
    }

    let valid = match std::str::from_utf8(prefix) {
        Ok(s) => s,
        Err(e) if e.error_len().is_none() => {
            // incomplete trailing character
            match std::str::from_utf8(&prefix[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };

    valid
        .chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}

/// Decodes one line per record
#[derive(Debug)]
pub struct TextDecoder {
    stream: SniffStream,

    /// Bytes of the buffer already searched for a newline
    scanned: usize,
}

impl TextDecoder {
    pub fn new(stream: SniffStream) -> Self {
        Self { stream, scanned: 0 }
    }

    /// Take `len` bytes as a line, dropping `skip` terminator bytes after it
    fn take_line(&mut self, len: usize, skip: usize) -> String {
        let line = String::from_utf8_lossy(&self.stream.buffered()[..len]).into_owned();
        self.stream.consume(len + skip);
        self.scanned = 0;
        line
    }
}

impl RecordDecoder for TextDecoder {
    fn next_record(&mut self) -> Result<Next, DecodeError> {
        loop {
            let buffered = self.stream.buffered();
            let available = buffered.len();
            let newline = buffered[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| self.scanned + i);

            let line = match newline {
                Some(end) => Some(self.take_line(end, 1)),
                None if available > MAX_LINE => {
                    let cut = floor_char_boundary(buffered, MAX_LINE);
                    Some(self.take_line(cut, 0))
                }
                None => {
                    self.scanned = available;
                    None
                }
            };

            if let Some(line) = line {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                return Ok(Next::Record(parse_line(line)));
            }

            match self.stream.fill_more() {
                Ok(0) => {
                    let rest = self.stream.buffered().len();
                    if rest == 0 {
                        return Ok(Next::EndOfStream);
                    }
                    // final line without a terminator
                    let line = self.take_line(rest, 0);
                    if line.trim().is_empty() {
                        return Ok(Next::EndOfStream);
                    }
                    return Ok(Next::Record(parse_line(line.trim_end_matches('\r'))));
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(Next::TimedOut),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Largest index `<= idx` that does not split a UTF-8 sequence
///
/// Never returns 0 for a non-zero `idx`, so a cut always makes progress.
fn floor_char_boundary(bytes: &[u8], idx: usize) -> usize {
    if idx >= bytes.len() {
        return bytes.len();
    }
    let mut at = idx;
    // continuation bytes are 0b10xx_xxxx
    while at > 0 && bytes[at] & 0xC0 == 0x80 {
        at -= 1;
    }
    if at == 0 { idx } else { at }
}

/// Build a record from one line of text
fn parse_line(line: &str) -> LogRecord {
    let (timestamp, content) = extract_timestamp(line);
    let record = LogRecord::new(extract_level(content), line);
    match timestamp {
        Some(timestamp) => record.with_timestamp(timestamp),
        None => record,
    }
}

/// Split a leading RFC 3339 timestamp from the rest of the line
fn extract_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    let token_end = line.find(char::is_whitespace).unwrap_or(line.len());
    let token = &line[..token_end];

    // shortest form: 2024-01-15T10:30:00Z
    if token.len() >= 20 {
        if let Ok(ts) = DateTime::parse_from_rfc3339(token) {
            return (Some(ts.with_timezone(&Utc)), line[token_end..].trim_start());
        }
    }
    (None, line)
}

/// Severity keyword patterns, most specific first
const BRACKET_PATTERNS: &[(&str, LogLevel)] = &[
    ("[FATAL]", LogLevel::Fatal),
    ("[CRITICAL]", LogLevel::Fatal),
    ("[ERROR]", LogLevel::Error),
    ("[ERR]", LogLevel::Error),
    ("[WARN]", LogLevel::Warn),
    ("[WARNING]", LogLevel::Warn),
    ("[INFO]", LogLevel::Info),
    ("[DEBUG]", LogLevel::Debug),
    ("[TRACE]", LogLevel::Trace),
];

const COLON_PATTERNS: &[(&str, LogLevel)] = &[
    ("FATAL:", LogLevel::Fatal),
    ("ERROR:", LogLevel::Error),
    ("WARNING:", LogLevel::Warn),
    ("WARN:", LogLevel::Warn),
    ("INFO:", LogLevel::Info),
    ("DEBUG:", LogLevel::Debug),
    ("TRACE:", LogLevel::Trace),
];

const SPACED_PATTERNS: &[(&str, LogLevel)] = &[
    (" FATAL ", LogLevel::Fatal),
    (" ERROR ", LogLevel::Error),
    (" WARN ", LogLevel::Warn),
    (" WARNING ", LogLevel::Warn),
    (" INFO ", LogLevel::Info),
    (" DEBUG ", LogLevel::Debug),
    (" TRACE ", LogLevel::Trace),
];

/// Guess the severity of a text line; lines without a keyword are INFO
fn extract_level(content: &str) -> LogLevel {
    let upper = content.to_uppercase();

    for patterns in [BRACKET_PATTERNS, COLON_PATTERNS, SPACED_PATTERNS] {
        if let Some((_, level)) = patterns.iter().find(|(p, _)| upper.contains(p)) {
            return *level;
        }
    }

    // level as the first word, e.g. PatternLayout "%-5level %msg"
    upper
        .split_whitespace()
        .next()
        .and_then(LogLevel::parse)
        .unwrap_or_default()
}
