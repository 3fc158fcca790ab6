//! Connection dispatch runtime.
//!
//! The `Server` owns the listening socket and hands every accepted
//! connection to exactly one dispatch strategy, chosen at startup:
//! - `threads`: one detached thread per connection
//! - `pool`: a fixed worker pool behind a bounded `TaskQueue`
//! - `event_loop`: a single thread multiplexing sockets with mio
//!
//! Each strategy calls the injected `Handler` with the connection and
//! closes it once the handler returns.

mod connection;
mod event_loop;
mod listener;
mod pool;
mod queue;
mod threads;

pub use connection::{Connection, ConnectionCounter, ConnectionRegistry, Task};
pub use listener::{create_listener, SetupError};
pub use pool::{WorkerPool, DEFAULT_SHUTDOWN_GRACE};
pub use queue::{PushError, QueueError, TaskQueue};

use crate::config::{Config, DispatchMode};
use crate::handler::Handler;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A bound server, ready to run one dispatch strategy.
pub struct Server {
    listener: TcpListener,
    config: Config,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Create, bind and listen on the configured address.
    pub fn bind(config: Config) -> Result<Self, SetupError> {
        let addr = listener::parse_addr(&config.listen)?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr().map_err(SetupError::Listen)?;

        info!(addr = %local_addr, backlog = config.backlog, "Listening");

        Ok(Self {
            listener,
            config,
            shutdown: ShutdownHandle::new(local_addr),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve connections with the configured strategy until shut down.
    pub fn run<H: Handler>(self, handler: H) -> io::Result<()> {
        let handler: Arc<dyn Handler> = Arc::new(handler);

        info!(mode = %self.config.mode, "Dispatching connections");

        match self.config.mode {
            DispatchMode::ThreadPool => {
                pool::run(&self.listener, &self.config, handler, &self.shutdown)
            }
            DispatchMode::Threads => {
                threads::run(&self.listener, &self.config, handler, &self.shutdown)
            }
            DispatchMode::Epoll => {
                event_loop::run(&self.listener, &self.config, handler, &self.shutdown)
            }
        }
    }
}

/// Requests a running server to stop accepting and return.
///
/// In-flight handlers are not interrupted.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    wake_addr: SocketAddr,
    waker: Arc<Mutex<Option<Arc<mio::Waker>>>>,
}

impl ShutdownHandle {
    fn new(local_addr: SocketAddr) -> Self {
        // A wildcard listener is reachable through loopback
        let ip = match local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };

        Self {
            requested: Arc::new(AtomicBool::new(false)),
            wake_addr: SocketAddr::new(ip, local_addr.port()),
            waker: Arc::new(Mutex::new(None)),
        }
    }

    /// Ask the server to stop.
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::Release);

        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
            return;
        }

        // Blocking acceptors only notice the flag once accept() returns
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, Duration::from_secs(1)) {
            debug!(error = %e, "Wake-up connection failed");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn install_waker(&self, waker: Arc<mio::Waker>) {
        *self.waker.lock() = Some(waker);
    }
}

/// Run the handler on a connection and log the outcome.
///
/// A panicking handler is contained here, so one bad connection never takes
/// down the acceptor or the event loop.
fn serve(handler: &dyn Handler, conn: &mut Connection) {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(conn))) {
        Ok(Ok(())) => debug!(conn = conn.id(), "Connection served"),
        Ok(Err(e)) => debug!(conn = conn.id(), peer = %conn.peer(), error = %e, "Connection error"),
        Err(_) => error!(conn = conn.id(), peer = %conn.peer(), "Handler panicked"),
    }
}

/// Blocking accept loop shared by the thread-based strategies.
///
/// Accept failures are logged and skipped. Returns once shutdown has been
/// requested.
fn accept_loop<F>(
    listener: &TcpListener,
    config: &Config,
    shutdown: &ShutdownHandle,
    counter: &ConnectionCounter,
    mut dispatch: F,
) -> io::Result<()>
where
    F: FnMut(Connection),
{
    listener.set_nonblocking(false)?;
    let io_timeout = config.io_timeout();

    loop {
        let accepted = listener.accept();
        if shutdown.is_requested() {
            info!(accepted = counter.accepted(), "Shutdown requested, no longer accepting");
            return Ok(());
        }

        match accepted {
            Ok((stream, peer)) => {
                let conn = Connection::new(counter.next_id(), stream, peer);
                if let Err(e) = conn.prepare(io_timeout) {
                    debug!(conn = conn.id(), error = %e, "Failed to configure connection");
                    continue;
                }
                debug!(conn = conn.id(), peer = %peer, "Accepted connection");
                dispatch(conn);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "Accept error");
                if let Some(pause) = listener::accept_backoff(&e) {
                    thread::sleep(pause);
                }
            }
        }
    }
}
