use std::time::Duration;

use crate::error::{Result, ServerError};

// =============================================================================
// Constants
// =============================================================================

/// Default listening port
pub const DEFAULT_PORT: u16 = 4445;

/// Default accept/read timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default bind address
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

// =============================================================================
// Configuration
// =============================================================================

/// Listening socket configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    address: String,

    /// Listen port, 0 for an ephemeral port
    port: u16,

    /// Accept and read timeout (zero = wait indefinitely)
    timeout: Duration,
}

impl ServerConfig {
    /// Validate and build a configuration
    ///
    /// Values are taken as signed so that out-of-range input from settings
    /// files is rejected rather than truncated.
    pub fn new(port: i64, timeout_ms: i64) -> Result<Self> {
        let port = u16::try_from(port).map_err(|_| ServerError::InvalidPort(port))?;
        let timeout = u64::try_from(timeout_ms)
            .map(Duration::from_millis)
            .map_err(|_| ServerError::InvalidTimeout(timeout_ms))?;

        Ok(Self {
            address: DEFAULT_ADDRESS.to_string(),
            port,
            timeout,
        })
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Socket read timeout, `None` meaning blocking reads
    pub fn read_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// Interval at which loops re-check for shutdown
    pub fn poll_interval(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }

    /// Get the socket address to bind to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port(), 4445);
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(config.bind_address(), "0.0.0.0:4445");
    }

    #[test_case(-1 ; "negative")]
    #[test_case(65536 ; "too large")]
    fn test_invalid_port(port: i64) {
        assert!(matches!(
            ServerConfig::new(port, 500),
            Err(ServerError::InvalidPort(p)) if p == port
        ));
    }

    #[test]
    fn test_port_bounds_accepted() {
        assert_eq!(ServerConfig::new(0, 500).unwrap().port(), 0);
        assert_eq!(ServerConfig::new(65535, 500).unwrap().port(), 65535);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        assert!(matches!(
            ServerConfig::new(4445, -1),
            Err(ServerError::InvalidTimeout(-1))
        ));
    }

    #[test]
    fn test_zero_timeout_blocks_reads_but_still_polls() {
        let config = ServerConfig::new(4445, 0).unwrap();
        assert_eq!(config.read_timeout(), None);
        assert_eq!(config.poll_interval(), DEFAULT_TIMEOUT);

        let config = ServerConfig::new(4445, 50).unwrap();
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_with_address() {
        let config = ServerConfig::new(0, 100).unwrap().with_address("127.0.0.1");
        assert_eq!(config.bind_address(), "127.0.0.1:0");
    }
}
