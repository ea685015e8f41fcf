//! Error types for the ingestion server

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised by the ingestion server and reported to its error listeners
#[derive(Error, Debug)]
pub enum ServerError {
    /// Port outside `0..=65535`
    #[error("invalid port {0}: must be between 0 and 65535")]
    InvalidPort(i64),

    /// Negative timeout
    #[error("invalid timeout {0}ms: must not be negative")]
    InvalidTimeout(i64),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    /// `stop(true)` called from a thread the stop would wait for
    #[error("cannot wait for server shutdown from one of its own worker threads")]
    StopFromWorker,

    /// The listening socket could not be bound
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The listening socket failed while accepting
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// A server thread could not be spawned
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    /// A single connection terminated
    #[error("connection from {peer}: {source}")]
    Connection {
        peer: SocketAddr,
        #[source]
        source: ConnectionError,
    },
}

/// Reasons a client connection ended
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The client closed the connection
    #[error("client connection terminated")]
    Closed,

    /// The client closed the connection without sending anything
    #[error("stream closed before any data was received")]
    EmptyStream,

    /// Shutdown was requested before the first byte arrived
    #[error("no data received before shutdown")]
    ShuttingDown,

    /// No registered decoder claimed the stream
    #[error("unrecognized wire format")]
    UnrecognizedFormat,

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Whether this is an ordinary end of a connection rather than a failure
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Closed | Self::ShuttingDown)
    }
}

/// Errors raised by a record decoder
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid XML event: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// The byte stream violates the wire format
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The stream ended in the middle of a record
    #[error("stream ended inside a record ({pending} bytes pending)")]
    Truncated { pending: usize },
}

/// Rejection from [`Executor::execute`](crate::Executor::execute)
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("executor is shut down")]
    Shutdown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}
