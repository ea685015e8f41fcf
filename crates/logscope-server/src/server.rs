use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use logscope_types::{ListenerSet, LogRecord};

use crate::config::ServerConfig;
use crate::decode::{DecoderFactory, WireFormat, factories};
use crate::error::{ConnectionError, ExecuteError, Result, ServerError};
use crate::executor::Executor;
use crate::handler::{ConnectionHandler, RecordSink};
use crate::sniff::is_timeout;

/// Pending connections queued by the kernel
const LISTEN_BACKLOG: i32 = 128;

/// Callback receiving `true` when the server starts and `false` when it stops
pub type StateListener = dyn Fn(bool) + Send + Sync;

/// Callback receiving a context message and the error that occurred
pub type ErrorListener = dyn Fn(&str, &ServerError) + Send + Sync;

/// Resources held while the server runs
#[derive(Clone)]
struct Running {
    executor: Arc<Executor>,
    local_addr: SocketAddr,
}

struct Inner {
    config: ServerConfig,
    factories: Arc<[Arc<dyn DecoderFactory>]>,
    sink: Arc<RecordSink>,

    /// Serializes start and stop of this instance
    lifecycle: Mutex<()>,

    /// Present from a successful start until the matching stop
    current: RwLock<Option<Running>>,

    /// Executor whose handlers a `stop(true)` is waiting for
    draining: RwLock<Option<Arc<Executor>>>,

    state_listeners: ListenerSet<StateListener>,
    error_listeners: ListenerSet<ErrorListener>,
}

/// TCP server accepting log event connections
///
/// Every connection is served on its own thread, which detects the wire
/// format once and forwards decoded records to the sink. State listeners are
/// notified while the lifecycle lock is held and must not call
/// [`start`](Self::start) or [`stop`](Self::stop).
pub struct IngestServer {
    inner: Arc<Inner>,
}

impl IngestServer {
    /// Create a stopped server that probes `factories` in order
    pub fn new<F>(config: ServerConfig, factories: Vec<Arc<dyn DecoderFactory>>, sink: F) -> Self
    where
        F: Fn(LogRecord) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                factories: factories.into(),
                sink: Arc::new(sink),
                lifecycle: Mutex::new(()),
                current: RwLock::new(None),
                draining: RwLock::new(None),
                state_listeners: ListenerSet::new(),
                error_listeners: ListenerSet::new(),
            }),
        }
    }

    /// Create a stopped server using the built-in decoders for `formats`
    pub fn with_formats<F>(config: ServerConfig, formats: &[WireFormat], sink: F) -> Self
    where
        F: Fn(LogRecord) + Send + Sync + 'static,
    {
        Self::new(config, factories(formats), sink)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn add_state_listener(&self, listener: &Arc<StateListener>) -> bool {
        self.inner.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, listener: &Arc<StateListener>) -> bool {
        self.inner.state_listeners.remove(listener)
    }

    pub fn add_error_listener(&self, listener: &Arc<ErrorListener>) -> bool {
        self.inner.error_listeners.add(listener)
    }

    pub fn remove_error_listener(&self, listener: &Arc<ErrorListener>) -> bool {
        self.inner.error_listeners.remove(listener)
    }

    /// Whether the server holds a listening socket and is not shutting down
    pub fn is_running(&self) -> bool {
        self.inner
            .current
            .read()
            .as_ref()
            .is_some_and(|running| !running.executor.is_shutdown())
    }

    /// Address the listening socket is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.current.read().as_ref().map(|running| running.local_addr)
    }

    /// Bind the listening socket and start accepting connections
    ///
    /// On bind failure error listeners are notified, the server stays stopped
    /// and state listeners hear nothing.
    pub fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock();

        if let Some(stale) = inner.take_stale() {
            // a failed acceptor shut down but has not finished stopping yet
            debug!(addr = %stale.local_addr, "Completing stop of failed server");
            inner.notify_state(false);
        }
        if inner.current.read().is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let (listener, local_addr) = match inner.bind() {
            Ok(bound) => bound,
            Err(e) => {
                inner.notify_error("failed to start the server", &e);
                return Err(e);
            }
        };

        let executor = Executor::new();
        *inner.current.write() = Some(Running {
            executor: Arc::clone(&executor),
            local_addr,
        });

        let acceptor = {
            let inner = Arc::clone(inner);
            let executor = Arc::clone(&executor);
            move || inner.accept_loop(listener, executor)
        };
        if let Err(e) = executor.execute(format!("logscope-accept-{}", local_addr.port()), acceptor) {
            inner.current.write().take();
            let e = match e {
                ExecuteError::Spawn(e) => ServerError::Spawn(e),
                ExecuteError::Shutdown => ServerError::NotRunning,
            };
            inner.notify_error("failed to start the server", &e);
            return Err(e);
        }

        info!(addr = %local_addr, "Server started");
        inner.notify_state(true);
        Ok(local_addr)
    }

    /// Stop accepting connections and signal handlers to finish
    ///
    /// With `await_completion`, blocks until every handler thread has exited.
    /// That wait is refused from the server's own threads. A handler calling
    /// `stop(false)` while another thread is already stopping the server gets
    /// [`ServerError::NotRunning`].
    pub fn stop(&self, await_completion: bool) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = match &inner.worker_executor() {
            Some(_) if await_completion => return Err(ServerError::StopFromWorker),
            Some(executor) => inner
                .lock_from_worker(executor)
                .ok_or(ServerError::NotRunning)?,
            None => inner.lifecycle.lock(),
        };

        let executor = match inner.current.read().as_ref() {
            Some(running) => Arc::clone(&running.executor),
            None => return Err(ServerError::NotRunning),
        };

        if await_completion {
            *inner.draining.write() = Some(Arc::clone(&executor));
        }
        inner.current.write().take();
        executor.shutdown();
        debug!(handlers = executor.active_count(), "Server shutting down");

        if await_completion {
            let poll = inner.config.poll_interval();
            while !executor.await_termination(poll) {
                debug!(handlers = executor.active_count(), "Waiting for handlers to finish");
            }
            inner.draining.write().take();
        }

        info!("Server stopped");
        inner.notify_state(false);
        Ok(())
    }
}

impl Drop for IngestServer {
    fn drop(&mut self) {
        if self.inner.current.read().is_some() {
            let _ = self.stop(false);
        }
    }
}

impl Inner {
    fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let address = self.config.bind_address();
        let bind_error = |source: io::Error| ServerError::Bind {
            address: address.clone(),
            source,
        };

        let listener = bind_listener(&address, self.config.poll_interval()).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        Ok((listener, local_addr))
    }

    /// Executor of this server that the calling thread works for, if any
    fn worker_executor(&self) -> Option<Arc<Executor>> {
        let current = self.current.read().as_ref().map(|r| Arc::clone(&r.executor));
        let draining = self.draining.read().clone();
        [current, draining]
            .into_iter()
            .flatten()
            .find(|executor| executor.is_current_worker())
    }

    /// Take the lifecycle lock on one of this server's own threads
    ///
    /// A concurrent `stop(true)` holds the lock while it waits for this
    /// thread to exit, so give up once the executor has been shut down.
    fn lock_from_worker(&self, executor: &Executor) -> Option<MutexGuard<'_, ()>> {
        let poll = self.config.poll_interval();
        loop {
            if let Some(guard) = self.lifecycle.try_lock_for(poll) {
                return Some(guard);
            }
            if executor.is_shutdown() {
                debug!("Server is already stopping");
                return None;
            }
        }
    }

    /// Remove a running entry whose executor was shut down by a failed acceptor
    fn take_stale(&self) -> Option<Running> {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|r| r.executor.is_shutdown()) {
            current.take()
        } else {
            None
        }
    }

    fn is_current(&self, executor: &Arc<Executor>) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|r| Arc::ptr_eq(&r.executor, executor))
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener, executor: Arc<Executor>) {
        while !executor.is_shutdown() {
            match accept_once(&listener) {
                Ok(Some((stream, peer))) => self.dispatch(stream, peer, &executor),
                Ok(None) => {}
                Err(e) => {
                    self.abort(&executor, ServerError::Accept(e));
                    break;
                }
            }
        }

        debug!("Acceptor finished");
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, executor: &Arc<Executor>) {
        debug!(%peer, "Accepted connection");

        let handler = ConnectionHandler {
            stream,
            peer,
            factories: Arc::clone(&self.factories),
            sink: Arc::clone(&self.sink),
            executor: Arc::clone(executor),
            read_timeout: self.config.read_timeout(),
        };
        let inner = Arc::clone(self);
        let task = move || {
            if let Err(e) = handler.run() {
                inner.report_connection(peer, e);
            }
        };

        match executor.execute(format!("logscope-conn-{peer}"), task) {
            Ok(()) => {}
            Err(ExecuteError::Shutdown) => debug!(%peer, "Dropping connection during shutdown"),
            Err(ExecuteError::Spawn(e)) => {
                self.notify_error("failed to start connection handler", &ServerError::Spawn(e));
            }
        }
    }

    /// Stop after the listening socket failed, without waiting for handlers
    ///
    /// Runs on the acceptor thread, so it must not block on a `stop(true)`
    /// that is itself waiting for this thread.
    fn abort(&self, executor: &Arc<Executor>, err: ServerError) {
        warn!(error = %err, "Listening socket failed, stopping server");
        self.notify_error("listening socket failed, stopping the server", &err);
        executor.shutdown();

        let poll = self.config.poll_interval();
        loop {
            if let Some(_lifecycle) = self.lifecycle.try_lock_for(poll) {
                let taken = {
                    let mut current = self.current.write();
                    if current.as_ref().is_some_and(|r| Arc::ptr_eq(&r.executor, executor)) {
                        current.take()
                    } else {
                        None
                    }
                };
                if taken.is_some() {
                    info!("Server stopped");
                    self.notify_state(false);
                }
                return;
            }

            if !self.is_current(executor) {
                // another caller completed the stop
                return;
            }
        }
    }

    fn report_connection(&self, peer: SocketAddr, source: ConnectionError) {
        if source.is_expected() {
            debug!(%peer, reason = %source, "Connection ended");
        } else {
            warn!(%peer, error = %source, "Connection failed");
        }

        let context = match source {
            ConnectionError::Closed => "client connection terminated, handler thread is going down",
            ConnectionError::ShuttingDown => "server shut down before the client sent data",
            ConnectionError::EmptyStream => "client closed the connection without sending data",
            ConnectionError::UnrecognizedFormat => "unsupported event format",
            ConnectionError::Decode(_) => "failed to decode event",
            ConnectionError::Io(_) => "connection I/O failure",
        };
        self.notify_error(context, &ServerError::Connection { peer, source });
    }

    fn notify_state(&self, running: bool) {
        self.state_listeners.for_each(|listener| listener(running));
    }

    fn notify_error(&self, context: &str, err: &ServerError) {
        self.error_listeners.for_each(|listener| listener(context, err));
    }
}

/// Bind a listening socket whose `accept` gives up after `wait`
///
/// The receive timeout lets the acceptor re-check for shutdown without
/// polling a non-blocking socket.
fn bind_listener(address: &str, wait: Duration) -> io::Result<TcpListener> {
    let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_read_timeout(Some(wait))?;
    Ok(socket.into())
}

/// Accept one connection
///
/// `Ok(None)` means the receive timeout elapsed or a single client failed.
fn accept_once(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    match listener.accept() {
        Ok(accepted) => Ok(Some(accepted)),
        Err(e) if is_timeout(&e) => Ok(None),
        Err(e) if is_transient(&e) => {
            debug!(error = %e, "Transient accept failure");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Accept errors caused by a single client rather than the listening socket
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
    )
}
