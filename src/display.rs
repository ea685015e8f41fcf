//! Terminal rendering and export of visible records

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::Local;
use owo_colors::{OwoColorize, Style};

use logscope_logs::{LevelCounts, LiveView};
use logscope_types::{LogLevel, LogRecord, SharedRecord};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 24-bit colour parsed from `RRGGBB` hex
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl FromStr for Rgb {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("invalid colour '{s}', expected RRGGBB hex");
        }

        let channel = |at: usize| u8::from_str_radix(&hex[at..at + 2], 16);
        Ok(Self(channel(0)?, channel(2)?, channel(4)?))
    }
}

/// Foreground colour for each level
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    colors: [Rgb; LogLevel::ALL.len()],
}

impl Palette {
    /// Colours in ascending severity, matching [`LogLevel::ALL`]
    pub fn new(colors: [Rgb; LogLevel::ALL.len()]) -> Self {
        Self { colors }
    }

    pub fn color(&self, level: LogLevel) -> Rgb {
        self.colors[level as usize]
    }

    /// Truecolor foreground style for `level`
    pub fn style(&self, level: LogLevel) -> Style {
        let Rgb(r, g, b) = self.color(level);
        Style::new().truecolor(r, g, b)
    }
}

/// Render a record and its throwable chain, without a trailing newline
pub fn format_record(record: &LogRecord, palette: Option<&Palette>) -> String {
    let mut text = format!(
        "{} {:<5}",
        record.timestamp.with_timezone(&Local).format(TIME_FORMAT),
        record.level.as_str()
    );
    if let Some(thread) = &record.thread {
        let _ = write!(text, " [{thread}]");
    }
    if let Some(logger) = &record.logger_name {
        let _ = write!(text, " {logger} -");
    }
    let _ = write!(text, " {}", record.message);

    if let Some(thrown) = &record.thrown {
        for (depth, throwable) in thrown.chain().enumerate() {
            let prefix = if depth == 0 { "" } else { "Caused by: " };
            let _ = write!(text, "\n  {prefix}{}", throwable.summary());
            for frame in &throwable.frames {
                let _ = write!(text, "\n      {frame}");
            }
        }
    }

    match palette {
        Some(palette) => text.style(palette.style(record.level)).to_string(),
        None => text,
    }
}

/// One-line summary of visible records per level
pub fn format_counts(counts: &LevelCounts) -> String {
    let per_level: Vec<String> = LogLevel::ALL
        .iter()
        .map(|level| format!("{level} {}", counts.get(*level)))
        .collect();
    format!("{} visible records ({})", counts.total(), per_level.join(", "))
}

/// Write the visible records of `view` to `path` as uncoloured lines
///
/// The file is replaced. Returns the number of records written.
pub fn export(view: &LiveView, path: &Path) -> Result<usize> {
    let write_error = || format!("failed to write export file '{}'", path.display());
    let file = File::create(path)
        .with_context(|| format!("failed to create export file '{}'", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut written = 0;
    let mut failure = None;
    view.for_each(|record| {
        if failure.is_none() {
            match writeln!(out, "{}", format_record(record, None)) {
                Ok(()) => written += 1,
                Err(e) => failure = Some(e),
            }
        }
    });
    if let Some(e) = failure {
        return Err(e).with_context(write_error);
    }
    out.flush().with_context(write_error)?;

    Ok(written)
}

/// Writes records to an output stream as they become visible
pub struct Printer<W> {
    out: W,
    palette: Option<Palette>,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, palette: Option<Palette>) -> Self {
        Self { out, palette }
    }

    pub fn record(&mut self, record: &LogRecord) -> io::Result<()> {
        writeln!(self.out, "{}", format_record(record, self.palette.as_ref()))?;
        self.out.flush()
    }

    /// Reprint the whole visible window after the view was rebuilt
    pub fn replay(&mut self, records: &[SharedRecord]) -> io::Result<()> {
        writeln!(self.out, "--- view reset, {} visible records ---", records.len())?;
        for record in records {
            writeln!(self.out, "{}", format_record(record, self.palette.as_ref()))?;
        }
        self.out.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use logscope_logs::LogFilter;
    use logscope_types::{StackFrame, ThrowableInfo};
    use std::sync::Arc;

    fn record(level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(level, message).with_timestamp(Utc.timestamp_opt(1_705_314_600, 0).unwrap())
    }

    fn palette() -> Palette {
        Palette::new([
            Rgb(1, 1, 1),
            Rgb(2, 2, 2),
            Rgb(0, 128, 0),
            Rgb(255, 128, 0),
            Rgb(255, 0, 0),
            Rgb(128, 0, 0),
        ])
    }

    #[test]
    fn test_parse_rgb() {
        assert_eq!("ff8000".parse::<Rgb>().unwrap(), Rgb(255, 128, 0));
        assert_eq!("#008000".parse::<Rgb>().unwrap(), Rgb(0, 128, 0));
        assert!("ff80".parse::<Rgb>().is_err());
        assert!("gg0000".parse::<Rgb>().is_err());
        assert!("+f8000".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_palette_by_level() {
        let palette = palette();
        assert_eq!(palette.color(LogLevel::Trace), Rgb(1, 1, 1));
        assert_eq!(palette.color(LogLevel::Warn), Rgb(255, 128, 0));
        assert_eq!(palette.color(LogLevel::Fatal), Rgb(128, 0, 0));
    }

    #[test]
    fn test_format_plain() {
        let mut record = record(LogLevel::Warn, "disk almost full").with_logger("com.example.Disk");
        record.thread = Some("main".to_string());

        let text = format_record(&record, None);
        assert!(text.ends_with("WARN  [main] com.example.Disk - disk almost full"));
        assert!(!text.contains('\x1b'));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_format_colored() {
        let text = format_record(&record(LogLevel::Error, "boom"), Some(&palette()));
        assert!(text.starts_with("\x1b["));
        assert!(text.contains("38;2;255;0;0"));
        assert!(text.ends_with("boom\x1b[0m"));
        assert_eq!(palette().style(LogLevel::Error), Style::new().truecolor(255, 0, 0));
    }

    #[test]
    fn test_format_throwable_chain() {
        let mut root = ThrowableInfo::new("java.io.IOException", Some("disk".to_string()));
        root.frames.push(StackFrame {
            class_name: "com.example.Store".to_string(),
            method: "write".to_string(),
            file: Some("Store.java".to_string()),
            line: Some(42),
        });
        let mut outer = ThrowableInfo::new("java.lang.IllegalStateException", None);
        outer.cause = Some(Box::new(root));

        let text = format_record(&record(LogLevel::Error, "failed").with_thrown(outer), None);
        let lines: Vec<_> = text.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "  java.lang.IllegalStateException",
                "  Caused by: java.io.IOException: disk",
                "      at com.example.Store.write(Store.java:42)",
            ]
        );
    }

    #[test]
    fn test_format_counts() {
        let counts = LevelCounts {
            info: 2,
            error: 1,
            ..Default::default()
        };
        assert_eq!(
            format_counts(&counts),
            "3 visible records (TRACE 0, DEBUG 0, INFO 2, WARN 0, ERROR 1, FATAL 0)"
        );
    }

    #[test]
    fn test_export_writes_plain_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        let view = LiveView::new(8, LogFilter::new()).unwrap();
        view.put(record(LogLevel::Info, "one").with_logger("a.B"));
        view.put(record(LogLevel::Error, "two"));

        assert_eq!(export(&view, &path).unwrap(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO  a.B - one"));
        assert!(lines[1].ends_with("ERROR two"));
        assert!(!content.contains('\x1b'));
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let view = LiveView::new(1, LogFilter::new()).unwrap();
        let err = export(&view, Path::new("/nonexistent/dir/records.log")).unwrap_err();
        assert!(err.to_string().contains("failed to create export file"));
    }

    #[test]
    fn test_printer_replay() {
        let records: Vec<SharedRecord> = vec![
            Arc::new(record(LogLevel::Info, "one")),
            Arc::new(record(LogLevel::Info, "two")),
        ];
        let mut printer = Printer::new(Vec::new(), None);
        printer.record(&record(LogLevel::Debug, "before")).unwrap();
        printer.replay(&records).unwrap();

        let output = String::from_utf8(printer.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("before"));
        assert_eq!(lines[1], "--- view reset, 2 visible records ---");
        assert!(lines[3].ends_with("two"));
    }
}
