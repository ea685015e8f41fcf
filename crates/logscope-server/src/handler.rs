use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use logscope_types::LogRecord;

use crate::decode::{DecoderFactory, Next, Probe, RecordDecoder};
use crate::error::ConnectionError;
use crate::executor::Executor;
use crate::sniff::{SniffStream, is_timeout};

/// Callback receiving every decoded record
pub type RecordSink = dyn Fn(LogRecord) + Send + Sync;

/// Serves one accepted connection until it ends or the server shuts down
pub(crate) struct ConnectionHandler {
    pub(crate) stream: TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) factories: Arc<[Arc<dyn DecoderFactory>]>,
    pub(crate) sink: Arc<RecordSink>,
    pub(crate) executor: Arc<Executor>,
    pub(crate) read_timeout: Option<Duration>,
}

impl ConnectionHandler {
    /// Detect the wire format, then forward records to the sink
    ///
    /// The socket is closed when this returns, whatever the outcome.
    pub(crate) fn run(self) -> Result<(), ConnectionError> {
        self.stream.set_read_timeout(self.read_timeout)?;

        let mut stream = SniffStream::new(self.stream);
        wait_for_data(&mut stream, &self.executor)?;

        let (format, mut decoder) = detect(stream, &self.factories)?;
        debug!(peer = %self.peer, format, "Detected wire format");

        decode_loop(decoder.as_mut(), &*self.sink, &self.executor)
    }
}

/// Block until a byte other than whitespace is buffered
///
/// Leading whitespace stays in the buffer for the decoder. A stream that ends
/// after sending only whitespace is still handed to detection.
fn wait_for_data(stream: &mut SniffStream, executor: &Executor) -> Result<(), ConnectionError> {
    loop {
        if executor.is_shutdown() {
            return Err(ConnectionError::ShuttingDown);
        }

        let buffered = stream.buffered();
        if buffered.iter().any(|b| !b.is_ascii_whitespace()) {
            return Ok(());
        }
        if stream.reached_eof() {
            if buffered.is_empty() {
                return Err(ConnectionError::EmptyStream);
            }
            return Ok(());
        }

        match stream.fill_more() {
            Ok(_) => {}
            Err(e) if is_timeout(&e) => trace!("No data yet, waiting"),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Offer the stream to each factory in order until one claims it
fn detect(
    mut stream: SniffStream,
    factories: &[Arc<dyn DecoderFactory>],
) -> Result<(&'static str, Box<dyn RecordDecoder>), ConnectionError> {
    for factory in factories {
        match factory.probe(stream) {
            Probe::Claimed(decoder) => return Ok((factory.name(), decoder)),
            Probe::Declined(returned) => {
                trace!(format = factory.name(), "Format declined");
                stream = returned;
            }
        }
    }

    Err(ConnectionError::UnrecognizedFormat)
}

fn decode_loop(
    decoder: &mut dyn RecordDecoder,
    sink: &(dyn Fn(LogRecord) + Send + Sync + '_),
    executor: &Executor,
) -> Result<(), ConnectionError> {
    loop {
        if executor.is_shutdown() {
            debug!("Shutdown requested, closing connection");
            return Ok(());
        }

        match decoder.next_record()? {
            Next::Record(record) => sink(record),
            Next::TimedOut => {}
            Next::EndOfStream => return Err(ConnectionError::Closed),
        }
    }
}
