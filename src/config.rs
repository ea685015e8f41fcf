//! Viewer settings.
//!
//! Settings are read from an optional TOML file. Every section and key has a
//! default, so an empty file is valid:
//!
//! ```toml
//! [server]
//! port = 4445
//! timeout_ms = 500
//! address = "0.0.0.0"
//! formats = ["json", "xml", "text"]
//!
//! [view]
//! buffer = 4096
//!
//! [colors]
//! error = "ff0000"
//!
//! [[filters]]
//! field = "MESSAGE"
//! enabled = true
//! pattern = "timeout"
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use logscope_logs::{FilterSettings, LogFilter};
use logscope_server::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_TIMEOUT, ServerConfig, WireFormat};

use crate::display::{Palette, Rgb};

/// Default number of records each view buffer holds
pub const DEFAULT_BUFFER: usize = 4096;

/// Complete viewer settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub view: ViewSettings,
    pub colors: ColorSettings,
    pub filters: FilterSettings,
}

/// Listening socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// TCP port, 0 picks an ephemeral port
    pub port: i64,

    /// Read and accept timeout in milliseconds, 0 blocks
    pub timeout_ms: i64,

    /// Address to bind
    pub address: String,

    /// Wire formats probed on each connection, in order
    pub formats: Vec<WireFormat>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: i64::from(DEFAULT_PORT),
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as i64,
            address: DEFAULT_ADDRESS.to_string(),
            formats: WireFormat::DEFAULT_ORDER.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Records kept in each of the raw and filtered buffers
    pub buffer: usize,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER,
        }
    }
}

/// Per-level foreground colours as `RRGGBB` hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorSettings {
    pub trace: String,
    pub debug: String,
    pub info: String,
    pub warn: String,
    pub error: String,
    pub fatal: String,
}

impl Default for ColorSettings {
    fn default() -> Self {
        Self {
            trace: "a0a0a0".to_string(),
            debug: "808080".to_string(),
            info: "008000".to_string(),
            warn: "ff8000".to_string(),
            error: "ff0000".to_string(),
            fatal: "800000".to_string(),
        }
    }
}

impl ColorSettings {
    pub fn palette(&self) -> Result<Palette> {
        let parse = |name: &str, value: &str| -> Result<Rgb> {
            value
                .parse()
                .with_context(|| format!("invalid colour for level {name}"))
        };

        Ok(Palette::new([
            parse("trace", &self.trace)?,
            parse("debug", &self.debug)?,
            parse("info", &self.info)?,
            parse("warn", &self.warn)?,
            parse("error", &self.error)?,
            parse("fatal", &self.fatal)?,
        ]))
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;

        Self::from_toml(&content).with_context(|| format!("invalid config file '{}'", path.display()))
    }

    /// Parse and validate settings from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).context("invalid TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize settings")
    }

    /// Write settings to a TOML file, replacing it
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("failed to write config file '{}'", path.display()))
    }

    /// Check every value without clamping
    pub fn validate(&self) -> Result<()> {
        self.server_config()?;
        if self.view.buffer == 0 {
            bail!("view buffer must hold at least one record");
        }
        if self.server.formats.is_empty() {
            bail!("at least one wire format must be configured");
        }
        self.colors.palette()?;
        self.log_filter()?;
        Ok(())
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig::new(self.server.port, self.server.timeout_ms)
            .context("invalid server settings")?;
        Ok(config.with_address(self.server.address.clone()))
    }

    pub fn log_filter(&self) -> Result<LogFilter> {
        LogFilter::from_settings(&self.filters).context("invalid filter settings")
    }
}
