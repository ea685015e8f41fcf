mod config;
mod display;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use logscope_logs::{LiveView, LogFilter, ViewChange, ViewListener};
use logscope_server::{ErrorListener, IngestServer, ServerError, StateListener, WireFormat};
use logscope_types::{LogField, LogLevel};

use crate::config::Settings;
use crate::display::{Printer, export, format_counts};

/// Logscope - A terminal viewer for log4j events streamed over TCP
#[derive(Parser, Debug)]
#[command(name = "logscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (TOML), re-read for filters on SIGHUP
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, allow_negative_numbers = true)]
    port: Option<i64>,

    /// Accept and read timeout in milliseconds (0 blocks)
    #[arg(long, allow_negative_numbers = true)]
    timeout_ms: Option<i64>,

    /// Records kept in the raw and filtered buffers
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Wire format to probe, in order (repeatable)
    #[arg(long = "format", value_name = "FORMAT")]
    formats: Vec<WireFormat>,

    /// Only show records at this level or above
    #[arg(long, value_name = "LEVEL", value_parser = parse_level)]
    min_level: Option<LogLevel>,

    /// Disable colour output
    #[arg(long)]
    no_color: bool,

    /// Write the effective settings to FILE and exit
    #[arg(long, value_name = "FILE")]
    write_config: Option<PathBuf>,

    /// On exit, write the visible records to FILE as plain text
    #[arg(long, value_name = "FILE")]
    export: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// Overlay command line values onto file settings
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.server.timeout_ms = timeout_ms;
        }
        if let Some(buffer) = self.buffer_size {
            settings.view.buffer = buffer;
        }
        if !self.formats.is_empty() {
            settings.server.formats = self.formats.clone();
        }
    }

    /// Filter from `settings`, narrowed by `--min-level`
    fn filter(&self, settings: &Settings) -> Result<LogFilter> {
        let mut filter = settings.log_filter()?;
        if let Some(level) = self.min_level {
            let minimum = LogFilter::at_least(level).get(LogField::Level).settings();
            filter.get_mut(LogField::Level).apply(&minimum)?;
        }
        Ok(filter)
    }
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    LogLevel::parse(s).ok_or_else(|| format!("unknown level '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };

    // stdout carries records, diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    args.apply(&mut settings);

    let filter = args.filter(&settings)?;
    settings.filters = filter.settings();
    settings.validate()?;

    if let Some(path) = &args.write_config {
        settings.save(path)?;
        info!(path = %path.display(), "Settings written");
        return Ok(());
    }

    let palette = if args.no_color {
        None
    } else {
        Some(settings.colors.palette()?)
    };

    let view = Arc::new(
        LiveView::new(settings.view.buffer, filter).context("failed to create the record view")?,
    );
    let (change_tx, mut change_rx) = mpsc::unbounded_channel::<ViewChange>();
    let view_listener: Arc<ViewListener> = Arc::new(move |change: &ViewChange| {
        let _ = change_tx.send(change.clone());
    });
    view.add_listener(&view_listener);

    let sink_view = Arc::clone(&view);
    let server = Arc::new(IngestServer::with_formats(
        settings.server_config()?,
        &settings.server.formats,
        move |record| {
            sink_view.put(record);
        },
    ));

    let (state_tx, mut state_rx) = mpsc::unbounded_channel::<bool>();
    let state_listener: Arc<StateListener> = Arc::new(move |running: bool| {
        debug!(running, "Server state changed");
        let _ = state_tx.send(running);
    });
    server.add_state_listener(&state_listener);

    let error_listener: Arc<ErrorListener> = Arc::new(|context: &str, err: &ServerError| {
        match err {
            ServerError::Connection { source, .. } if source.is_expected() => {
                debug!(context, error = %err, "Connection closed");
            }
            _ => warn!(context, error = %err, "Server error"),
        }
    });
    server.add_error_listener(&error_listener);

    let addr = server.start().context("failed to start the log server")?;
    eprintln!("logscope listening on {addr}");

    let mut printer = Printer::new(io::stdout(), palette);
    let mut hangup = Hangup::new()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl-C")?;
                debug!("Interrupted");
                break;
            }

            Some(change) = change_rx.recv() => {
                match change {
                    ViewChange::Inserted(record) | ViewChange::Slid(record) => {
                        printer.record(&record)?;
                    }
                    ViewChange::Reset => printer.replay(&view.snapshot())?,
                }
            }

            Some(running) = state_rx.recv() => {
                if !running {
                    warn!("Log server stopped unexpectedly");
                    break;
                }
            }

            Some(()) = hangup.recv() => {
                match &args.config {
                    Some(path) => reload_filter(path, &args, &view),
                    None => warn!("SIGHUP received but no config file was given"),
                }
            }
        }
    }

    stop_server(server).await?;
    eprintln!("{}", format_counts(&view.level_counts()));

    if let Some(path) = &args.export {
        let written = export(&view, path)?;
        info!(path = %path.display(), records = written, "Visible records exported");
    }
    Ok(())
}

/// Re-read the filter section and apply it to the view
fn reload_filter(path: &Path, args: &Args, view: &LiveView) {
    let filter = Settings::from_file(path).and_then(|settings| args.filter(&settings));
    match filter {
        Ok(filter) if filter.settings() == view.filter().settings() => {
            debug!(path = %path.display(), "Filters unchanged");
        }
        Ok(filter) => {
            info!(path = %path.display(), active = filter.is_active(), "Reloaded filters");
            view.set_filter(filter);
        }
        Err(e) => {
            let error = format!("{e:#}");
            warn!(%error, "Keeping current filters");
        }
    }
}

/// Stop the server and wait for its handler threads off the async runtime
async fn stop_server(server: Arc<IngestServer>) -> Result<()> {
    let stopped = tokio::task::spawn_blocking(move || server.stop(true))
        .await
        .context("server shutdown task failed")?;

    match stopped {
        Ok(()) | Err(ServerError::NotRunning) => Ok(()),
        Err(e) => Err(e).context("failed to stop the log server"),
    }
}

/// SIGHUP stream, never firing where the signal does not exist
#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let signal = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
        Ok(Self(signal))
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
