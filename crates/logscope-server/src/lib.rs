//! TCP ingestion for logscope
//!
//! This crate provides the connection-accepting server, the per-connection
//! wire-format detection, and the built-in record decoders.

mod config;
pub mod decode;
mod error;
mod executor;
mod handler;
mod server;
mod sniff;

pub use config::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_TIMEOUT, ServerConfig};
pub use decode::{DecoderFactory, Next, Probe, RecordDecoder, WireFormat};
pub use error::{ConnectionError, DecodeError, ExecuteError, Result, ServerError};
pub use executor::Executor;
pub use handler::RecordSink;
pub use server::{ErrorListener, IngestServer, StateListener};
pub use sniff::{SniffStream, is_timeout};
