//! End-to-end tests for the ingestion server

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use logscope_server::{
    ConnectionError, DecodeError, DecoderFactory, ErrorListener, IngestServer, Next, Probe,
    RecordDecoder, ServerConfig, ServerError, SniffStream, StateListener, WireFormat, is_timeout,
};
use logscope_types::{LogLevel, LogRecord};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Test decoder: "TEST" magic followed by u32 length-prefixed UTF-8 messages
// =============================================================================

const MAGIC: &[u8] = b"TEST";

struct MagicFactory;

impl DecoderFactory for MagicFactory {
    fn name(&self) -> &'static str {
        "test"
    }

    fn probe(&self, mut stream: SniffStream) -> Probe {
        if stream.peek(MAGIC.len()).is_ok_and(|prefix| prefix == MAGIC) {
            Probe::Claimed(Box::new(MagicDecoder {
                stream,
                magic_consumed: false,
            }))
        } else {
            Probe::Declined(stream)
        }
    }
}

struct MagicDecoder {
    stream: SniffStream,
    magic_consumed: bool,
}

impl RecordDecoder for MagicDecoder {
    fn next_record(&mut self) -> Result<Next, DecodeError> {
        if !self.magic_consumed {
            self.stream.consume(MAGIC.len());
            self.magic_consumed = true;
        }

        loop {
            let buffered = self.stream.buffered();
            if buffered.len() >= 4 {
                let len = u32::from_be_bytes([buffered[0], buffered[1], buffered[2], buffered[3]]) as usize;
                if buffered.len() >= 4 + len {
                    let message = String::from_utf8(buffered[4..4 + len].to_vec())
                        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
                    self.stream.consume(4 + len);
                    return Ok(Next::Record(LogRecord::new(LogLevel::Info, message)));
                }
            }

            match self.stream.fill_more() {
                Ok(0) => return Ok(Next::EndOfStream),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(Next::TimedOut),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn frame(message: &str) -> Vec<u8> {
    let mut bytes = (message.len() as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(message.as_bytes());
    bytes
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    server: Arc<IngestServer>,
    records: Receiver<LogRecord>,
    errors: Receiver<(String, String)>,
    states: Arc<Mutex<Vec<bool>>>,
}

impl Harness {
    fn new(factories: Vec<Arc<dyn DecoderFactory>>) -> Self {
        Self::with_config(local_config(), factories)
    }

    fn with_config(config: ServerConfig, factories: Vec<Arc<dyn DecoderFactory>>) -> Self {
        let (record_tx, records) = mpsc::channel();
        let record_tx = Mutex::new(record_tx);
        let server = Arc::new(IngestServer::new(config, factories, move |record| {
            let _ = record_tx.lock().send(record);
        }));

        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let state_listener: Arc<StateListener> = Arc::new(move |running: bool| {
            sink.lock().push(running);
        });
        server.add_state_listener(&state_listener);

        let (error_tx, errors) = mpsc::channel();
        let error_tx = Mutex::new(error_tx);
        let error_listener: Arc<ErrorListener> = Arc::new(move |context: &str, err: &ServerError| {
            let kind = match err {
                ServerError::Connection { source, .. } => format!("{source:?}"),
                other => format!("{other:?}"),
            };
            let _ = error_tx.lock().send((context.to_string(), kind));
        });
        server.add_error_listener(&error_listener);

        Self {
            server,
            records,
            errors,
            states,
        }
    }

    fn start(&self) -> SocketAddr {
        self.server.start().expect("server should start")
    }

    fn states(&self) -> Vec<bool> {
        self.states.lock().clone()
    }

    fn next_error(&self) -> (String, String) {
        self.errors.recv_timeout(WAIT).expect("expected an error notification")
    }
}

fn local_config() -> ServerConfig {
    ServerConfig::new(0, 100).unwrap().with_address("127.0.0.1")
}

fn magic() -> Vec<Arc<dyn DecoderFactory>> {
    vec![Arc::new(MagicFactory)]
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_magic_decoder_end_to_end() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(MAGIC).unwrap();
    client.write_all(&frame("hello")).unwrap();
    client.flush().unwrap();

    let record = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(record.message, "hello");
    assert!(harness.records.recv_timeout(Duration::from_millis(300)).is_err());

    drop(client);
    let (context, kind) = harness.next_error();
    assert_eq!(kind, "Closed");
    assert!(context.contains("terminated"));

    harness.server.stop(true).unwrap();
}

#[test]
fn test_records_arrive_in_order() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(MAGIC).unwrap();
    for i in 0..20 {
        client.write_all(&frame(&format!("message {i}"))).unwrap();
    }

    for i in 0..20 {
        let record = harness.records.recv_timeout(WAIT).unwrap();
        assert_eq!(record.message, format!("message {i}"));
    }

    harness.server.stop(true).unwrap();
}

#[test]
fn test_double_stop_is_rejected_without_notification() {
    let harness = Harness::new(magic());
    harness.start();

    harness.server.stop(true).unwrap();
    assert!(matches!(harness.server.stop(true), Err(ServerError::NotRunning)));
    assert!(matches!(harness.server.stop(false), Err(ServerError::NotRunning)));

    assert_eq!(harness.states(), vec![true, false]);
}

#[test]
fn test_start_while_running_is_rejected() {
    let harness = Harness::new(magic());
    harness.start();

    assert!(matches!(harness.server.start(), Err(ServerError::AlreadyRunning)));
    assert!(harness.server.is_running());
    assert_eq!(harness.states(), vec![true]);

    harness.server.stop(true).unwrap();
}

#[test]
fn test_restart_after_stop() {
    let harness = Harness::new(magic());
    harness.start();
    harness.server.stop(true).unwrap();

    let addr = harness.start();
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(MAGIC).unwrap();
    client.write_all(&frame("again")).unwrap();
    assert_eq!(harness.records.recv_timeout(WAIT).unwrap().message, "again");

    harness.server.stop(true).unwrap();
    assert_eq!(harness.states(), vec![true, false, true, false]);
}

#[test]
fn test_zero_byte_connection() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    drop(TcpStream::connect(addr).unwrap());

    let (_, kind) = harness.next_error();
    assert_eq!(kind, "EmptyStream");
    assert!(harness.records.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(harness.server.is_running());

    // the server still serves new connections
    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(MAGIC).unwrap();
    client.write_all(&frame("still here")).unwrap();
    assert_eq!(harness.records.recv_timeout(WAIT).unwrap().message, "still here");

    harness.server.stop(true).unwrap();
}

#[test]
fn test_unrecognized_format() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"NOPE and more").unwrap();

    let (context, kind) = harness.next_error();
    assert_eq!(kind, "UnrecognizedFormat");
    assert_eq!(context, "unsupported event format");
    assert!(harness.server.is_running());

    harness.server.stop(true).unwrap();
}

#[test]
fn test_bind_conflict() {
    let first = Harness::new(magic());
    let addr = first.start();

    let config = ServerConfig::new(i64::from(addr.port()), 100)
        .unwrap()
        .with_address("127.0.0.1");
    let second = Harness::with_config(config, magic());

    assert!(matches!(second.server.start(), Err(ServerError::Bind { .. })));
    let (context, kind) = second.next_error();
    assert_eq!(context, "failed to start the server");
    assert!(kind.starts_with("Bind"));
    assert!(!second.server.is_running());
    assert!(second.states().is_empty());

    assert!(first.server.is_running());
    first.server.stop(true).unwrap();
}

#[test]
fn test_stop_waits_for_idle_connections() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let _idle = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // the idle handler notices shutdown on its next read timeout
    harness.server.stop(true).unwrap();
    let (_, kind) = harness.next_error();
    assert_eq!(kind, "ShuttingDown");
    assert!(!harness.server.is_running());
}

#[test]
fn test_stop_from_handler_thread() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let weak = Arc::downgrade(&harness.server);
    let listener: Arc<ErrorListener> = Arc::new(move |_: &str, _: &ServerError| {
        if let Some(server) = weak.upgrade() {
            let waited = server.stop(true).map_err(|e| format!("{e:?}"));
            let _ = tx.lock().send(waited);
        }
    });
    harness.server.add_error_listener(&listener);

    drop(TcpStream::connect(addr).unwrap());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err("StopFromWorker".to_string()));
    assert!(harness.server.is_running());

    harness.server.remove_error_listener(&listener);
    harness.server.stop(true).unwrap();
}

#[test]
fn test_handler_stop_during_shutdown_returns() {
    let harness = Harness::new(magic());
    let addr = harness.start();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let weak = Arc::downgrade(&harness.server);
    let listener: Arc<ErrorListener> = Arc::new(move |_: &str, _: &ServerError| {
        if let Some(server) = weak.upgrade() {
            let stopped = server.stop(false).map_err(|e| format!("{e:?}"));
            let _ = tx.lock().send(stopped);
        }
    });
    harness.server.add_error_listener(&listener);

    let _idle = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // the idle handler reports ShuttingDown from inside the waiting stop
    let server = Arc::clone(&harness.server);
    let (done_tx, done_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = done_tx.send(server.stop(true).is_ok());
    });

    assert!(done_rx.recv_timeout(WAIT).expect("stop(true) must not hang"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err("NotRunning".to_string()));
    assert!(!harness.server.is_running());
    assert_eq!(harness.states(), vec![true, false]);
}

#[test]
fn test_json_end_to_end() {
    let harness = Harness::new(logscope_server::decode::factories(&WireFormat::DEFAULT_ORDER));
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            br#"{"instant":{"epochSecond":1705314600,"nanoOfSecond":0},"level":"ERROR","loggerName":"com.example.Db","message":"connection lost","thrown":{"name":"java.sql.SQLException","message":"timeout"}}
"#,
        )
        .unwrap();
    client
        .write_all(br#"{"timeMillis":1705314601000,"level":"INFO","loggerName":"com.example.Db","message":"reconnected"}"#)
        .unwrap();

    let first = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(first.level, LogLevel::Error);
    assert_eq!(first.logger_name.as_deref(), Some("com.example.Db"));
    assert_eq!(first.thrown.unwrap().summary(), "java.sql.SQLException: timeout");

    let second = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(second.message, "reconnected");

    harness.server.stop(true).unwrap();
}

#[test]
fn test_json_after_leading_newline() {
    let harness = Harness::new(logscope_server::decode::factories(&WireFormat::DEFAULT_ORDER));
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"\n").unwrap();
    // longer than the read timeout
    std::thread::sleep(Duration::from_millis(300));
    client
        .write_all(br#"{"level":"ERROR","loggerName":"a.B","message":"boom"}"#)
        .unwrap();

    let record = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(record.level, LogLevel::Error);
    assert_eq!(record.logger_name.as_deref(), Some("a.B"));
    assert_eq!(record.message, "boom");

    harness.server.stop(true).unwrap();
}

#[test]
fn test_xml_end_to_end() {
    let harness = Harness::new(logscope_server::decode::factories(&WireFormat::DEFAULT_ORDER));
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(
            br#"<?xml version="1.0" encoding="UTF-8"?>
<Events xmlns="http://logging.apache.org/log4j/2.0/events">
<Event timeMillis="1705314600000" thread="main" level="WARN" loggerName="com.example.Cache">
  <Message>cache miss</Message>
</Event>
"#,
        )
        .unwrap();

    let record = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(record.level, LogLevel::Warn);
    assert_eq!(record.logger_name.as_deref(), Some("com.example.Cache"));
    assert_eq!(record.message, "cache miss");
    assert_eq!(record.timestamp.timestamp(), 1_705_314_600);

    harness.server.stop(true).unwrap();
}

#[test]
fn test_text_end_to_end() {
    let harness = Harness::new(logscope_server::decode::factories(&WireFormat::DEFAULT_ORDER));
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"2024-01-15T10:30:00Z WARN cache miss\n[ERROR] cache down\n")
        .unwrap();

    let first = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(first.level, LogLevel::Warn);
    assert_eq!(first.timestamp.timestamp(), 1_705_314_600);

    let second = harness.records.recv_timeout(WAIT).unwrap();
    assert_eq!(second.level, LogLevel::Error);

    harness.server.stop(true).unwrap();
}

#[test]
fn test_connection_error_is_reported_typed() {
    let harness = Harness::new(vec![WireFormat::Json.factory()]);
    let addr = harness.start();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(br#"{"message": oops}"#).unwrap();

    let (context, kind) = harness.next_error();
    assert_eq!(context, "failed to decode event");
    assert!(kind.starts_with("Decode(Json"));

    // typed access for callers that inspect errors
    let err = ServerError::Connection {
        peer: addr,
        source: ConnectionError::Decode(DecodeError::Truncated { pending: 3 }),
    };
    assert!(err.to_string().contains("3 bytes pending"));

    harness.server.stop(true).unwrap();
}
