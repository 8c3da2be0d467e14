//! Generic single-client TCP server.
//!
//! A [`Server`] owns one thread that binds a listening socket, waits for
//! connections with `poll(2)` so that a stop request is noticed within
//! one poll interval, and hands each accepted connection to a
//! [`ConnectionHandler`]. Connections are served one at a time; a second
//! client waits in the listen backlog until the first one leaves.
//!
//! Failures of a single connection are logged and the server goes back to
//! accepting. Only failures of the listening socket itself end the server
//! in [`ServerStatus::Error`].

mod control;
mod frames;
mod status;

pub use control::{ControlHandler, MAX_COMMAND_LEN};
pub use frames::FrameStreamHandler;
pub use status::ServerStatus;

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::ServerSettings;
use crate::stream::{HeaderError, StreamState};

/// Errors that end a server or prevent it from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("poll on listening socket failed: {0}")]
    Poll(#[from] Errno),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to spawn server thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("server is {0}")]
    NotRunning(ServerStatus),
    #[error("server did not start within {0:?}")]
    StartTimeout(Duration),
}

/// Errors that end a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("send failed: {0}")]
    Send(#[from] HeaderError),
    #[error("no frame for {0:?}")]
    FrameTimeout(Duration),
    #[error("stream stopped ({0})")]
    StreamStopped(StreamState),
    #[error("command longer than {0} bytes")]
    LineTooLong(usize),
}

/// Serves one accepted connection.
///
/// `handle` runs on the server thread and blocks the accept loop until it
/// returns. It should check [`Connection::should_stop`] regularly.
pub trait ConnectionHandler: Send + 'static {
    fn handle(&mut self, conn: &mut Connection<'_>) -> Result<(), ConnectionError>;
}

/// An accepted client as seen by a [`ConnectionHandler`].
pub struct Connection<'a> {
    stream: TcpStream,
    peer: SocketAddr,
    server: &'a str,
    stop: &'a AtomicBool,
}

impl Connection<'_> {
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn server_name(&self) -> &str {
        self.server
    }

    /// True once the owning server has been asked to stop.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Listening address and timing of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in logs and thread names.
    pub name: String,
    pub addr: SocketAddr,
    /// Write timeout applied to every accepted socket.
    pub send_timeout: Duration,
    /// Upper bound on how long a stop request goes unnoticed while idle.
    pub accept_poll: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            send_timeout: Duration::from_secs(10),
            accept_poll: Duration::from_secs(1),
        }
    }

    /// Builds a config for `port` on the configured bind address.
    pub fn from_settings(name: impl Into<String>, port: u16, settings: &ServerSettings) -> Self {
        Self {
            name: name.into(),
            addr: SocketAddr::new(settings.bind_address, port),
            send_timeout: settings.send_timeout(),
            accept_poll: settings.accept_poll(),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_accept_poll(mut self, interval: Duration) -> Self {
        self.accept_poll = interval;
        self
    }
}

struct Shared {
    name: String,
    status: Mutex<ServerStatus>,
    status_changed: Condvar,
    stop: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Clone of the socket currently being served, for shutdown on stop.
    active: Mutex<Option<TcpStream>>,
    last_error: Mutex<Option<String>>,
    connections: AtomicU64,
}

impl Shared {
    fn status(&self) -> ServerStatus {
        *self.status.lock()
    }

    /// Moves to `next` unless the server already reached a terminal status.
    fn set_status(&self, next: ServerStatus) {
        let mut status = self.status.lock();
        if status.is_terminal() || *status == next {
            return;
        }
        // A stop request is not undone by the thread coming up late.
        if *status == ServerStatus::StopRequested && next == ServerStatus::Running {
            return;
        }
        tracing::debug!(server = %self.name, from = %*status, to = %next, "Server status changed");
        *status = next;
        self.status_changed.notify_all();
    }

    fn fail(&self, error: ServerError) {
        tracing::error!(server = %self.name, error = %error, "Server failed");
        *self.last_error.lock() = Some(error.to_string());
        self.set_status(ServerStatus::Error);
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        {
            let status = self.status.lock();
            if status.is_terminal() {
                return;
            }
        }
        self.set_status(ServerStatus::StopRequested);
        if let Some(stream) = self.active.lock().as_ref() {
            // Fails an in-flight send instead of waiting for the send timeout.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Handle to a running server thread.
pub struct Server {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Spawns the server thread and returns immediately.
    ///
    /// Binding happens on the new thread; use
    /// [`wait_until_running`](Self::wait_until_running) to learn whether it
    /// succeeded.
    pub fn start<H: ConnectionHandler>(config: ServerConfig, handler: H) -> Result<Self, ServerError> {
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            status: Mutex::new(ServerStatus::Starting),
            status_changed: Condvar::new(),
            stop: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            active: Mutex::new(None),
            last_error: Mutex::new(None),
            connections: AtomicU64::new(0),
        });
        let thread = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || serve(shared, config, handler)
            })
            .map_err(ServerError::Spawn)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Address the listener is bound to, once it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Message of the error that moved the server to `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Blocks until the server leaves `Starting` and returns its address.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<SocketAddr, ServerError> {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while *status == ServerStatus::Starting {
            if self
                .shared
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                return Err(ServerError::StartTimeout(timeout));
            }
        }
        let current = *status;
        drop(status);
        match (current, self.local_addr()) {
            (ServerStatus::Running, Some(addr)) => Ok(addr),
            (other, _) => Err(ServerError::NotRunning(other)),
        }
    }

    /// Asks the server thread to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// Stops the server and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.request_stop();
        if thread.join().is_err() {
            tracing::error!(server = %self.shared.name, "Server thread panicked");
            self.shared.set_status(ServerStatus::Error);
        }
        tracing::info!(server = %self.shared.name, status = %self.status(), "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

fn serve<H: ConnectionHandler>(shared: Arc<Shared>, config: ServerConfig, mut handler: H) {
    let listener = match bind(&config) {
        Ok(listener) => listener,
        Err(e) => {
            shared.fail(e);
            return;
        }
    };
    let addr = listener.local_addr().unwrap_or(config.addr);
    *shared.local_addr.lock() = Some(addr);
    shared.set_status(ServerStatus::Running);
    tracing::info!(server = %shared.name, %addr, "Server listening");

    let timeout = PollTimeout::try_from(config.accept_poll).unwrap_or(PollTimeout::MAX);
    while !shared.stop.load(Ordering::Acquire) {
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                shared.fail(ServerError::Poll(e));
                return;
            }
        }

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => {
                shared.fail(ServerError::Accept(e));
                return;
            }
        };
        shared.connections.fetch_add(1, Ordering::Relaxed);
        serve_client(&shared, &config, &mut handler, stream, peer);
    }
    shared.set_status(ServerStatus::Stopped);
}

fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind {
        addr: config.addr,
        source,
    };
    let listener = TcpListener::bind(config.addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    Ok(listener)
}

fn serve_client<H: ConnectionHandler>(
    shared: &Shared,
    config: &ServerConfig,
    handler: &mut H,
    stream: TcpStream,
    peer: SocketAddr,
) {
    tracing::info!(server = %shared.name, %peer, "Client connected");
    if let Err(e) = prepare_socket(&stream, config.send_timeout) {
        tracing::warn!(server = %shared.name, %peer, error = %e, "Failed to configure client socket");
        return;
    }
    match stream.try_clone() {
        Ok(clone) => *shared.active.lock() = Some(clone),
        Err(e) => tracing::warn!(server = %shared.name, error = %e, "Cannot clone client socket"),
    }
    // A stop request may have raced with the registration above.
    if shared.stop.load(Ordering::Acquire) {
        let _ = stream.shutdown(Shutdown::Both);
    }

    let started = Instant::now();
    let mut conn = Connection {
        stream,
        peer,
        server: &shared.name,
        stop: &shared.stop,
    };
    let result = handler.handle(&mut conn);
    shared.active.lock().take();
    let _ = conn.stream.shutdown(Shutdown::Both);

    let secs = started.elapsed().as_secs_f64();
    match result {
        Ok(()) => tracing::info!(server = %shared.name, %peer, secs, "Client disconnected"),
        Err(e) => tracing::warn!(server = %shared.name, %peer, secs, error = %e, "Connection dropped"),
    }
}

fn prepare_socket(stream: &TcpStream, send_timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(send_timeout))?;
    stream.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;

    fn local(name: &str) -> ServerConfig {
        ServerConfig::new(name, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .with_accept_poll(Duration::from_millis(20))
    }

    /// Writes a greeting, then echoes until the peer closes.
    struct Greeter;

    impl ConnectionHandler for Greeter {
        fn handle(&mut self, conn: &mut Connection<'_>) -> Result<(), ConnectionError> {
            let name = conn.server_name().to_string();
            conn.stream().write_all(name.as_bytes())?;
            let mut buf = [0u8; 64];
            loop {
                let n = conn.stream().read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                conn.stream().write_all(&buf[..n])?;
            }
        }
    }

    #[test]
    fn test_start_serve_stop() {
        let mut server = Server::start(local("greeter"), Greeter).unwrap();
        let addr = server.wait_until_running(Duration::from_secs(2)).unwrap();
        assert_eq!(server.status(), ServerStatus::Running);

        let mut client = TcpStream::connect(addr).unwrap();
        let mut greeting = [0u8; 7];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"greeter");
        client.write_all(b"abc").unwrap();
        let mut echo = [0u8; 3];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"abc");
        drop(client);

        // The server goes back to accepting after a client leaves.
        let mut second = TcpStream::connect(addr).unwrap();
        second.read_exact(&mut greeting).unwrap();
        drop(second);

        server.stop();
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(server.connections() >= 2);
        server.stop();
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[test]
    fn test_bind_failure_is_error() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = taken.local_addr().unwrap();
        let mut server = Server::start(ServerConfig::new("clash", addr), Greeter).unwrap();
        assert!(matches!(
            server.wait_until_running(Duration::from_secs(2)),
            Err(ServerError::NotRunning(ServerStatus::Error))
        ));
        assert!(server.last_error().is_some());
        server.stop();
        assert_eq!(server.status(), ServerStatus::Error);
    }

    #[test]
    fn test_stop_interrupts_blocked_handler() {
        let mut server = Server::start(local("blocked"), Greeter).unwrap();
        let addr = server.wait_until_running(Duration::from_secs(2)).unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        // Let the handler block in read().
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[test]
    fn test_status_terminal() {
        assert!(ServerStatus::Stopped.is_terminal());
        assert!(ServerStatus::Error.is_terminal());
        assert!(!ServerStatus::StopRequested.is_terminal());
        assert_eq!(ServerStatus::StopRequested.to_string(), "stop_requested");
    }
}
