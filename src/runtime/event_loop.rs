//! Single-threaded readiness event loop.
//!
//! Readiness-based model: poll tells us when the listener or a peer socket
//! is ready, and the loop reacts on its own thread. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! Per connection the lifecycle is `registered → ready → deregistered`:
//! a connection sits in the registry, idle and costing nothing, until its
//! socket becomes readable (data or EOF). It is then taken out of the
//! registry, the handler runs to completion on the loop thread, and the
//! socket is deregistered before it is closed.
//!
//! The handler runs synchronously, so a slow client stalls every other
//! connection for up to the configured I/O timeout. Serving partial reads
//! and writes per connection would lift this, at the cost of a state
//! machine per socket.

use super::{listener, serve, Connection, ConnectionCounter, ConnectionRegistry, ShutdownHandle};
use crate::config::Config;
use crate::handler::Handler;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Pause before retrying a drain that failed for a reason other than
/// resource exhaustion.
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// Run the event loop until shutdown is requested.
pub(super) fn run(
    listener: &TcpListener,
    config: &Config,
    handler: Arc<dyn Handler>,
    shutdown: &ShutdownHandle,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(config.max_events);

    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    shutdown.install_waker(Arc::new(waker));

    let listener_fd = listener.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&listener_fd), LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections = ConnectionRegistry::new(config.max_connections);
    let counter = ConnectionCounter::new();
    let io_timeout = config.io_timeout();

    info!(
        max_events = config.max_events,
        max_connections = config.max_connections,
        "Event loop started"
    );

    // Set when a drain stopped on an error with connections possibly still
    // pending: they will not be reported again, so poll wakes up to retry.
    let mut retry_accept: Option<Duration> = None;

    while !shutdown.is_requested() {
        if let Err(e) = poll.poll(&mut events, retry_accept) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        let mut accept_ready = retry_accept.is_some();
        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => accept_ready = true,
                WAKER_TOKEN => {}
                Token(key) => {
                    let Some(mut conn) = connections.remove(key) else {
                        continue;
                    };
                    dispatch(poll.registry(), &mut conn, handler.as_ref(), io_timeout);
                }
            }
        }

        if accept_ready {
            let drain = accept_connections(
                || listener.accept(),
                poll.registry(),
                &mut connections,
                &counter,
            );
            retry_accept = match drain {
                Drain::Complete => None,
                Drain::Deferred(pause) => Some(pause),
            };
        }
    }

    let _ = poll.registry().deregister(&mut SourceFd(&listener_fd));
    info!(
        accepted = counter.accepted(),
        idle = connections.len(),
        "Event loop stopped"
    );
    Ok(())
}

/// How an accept drain ended.
#[derive(Debug, PartialEq, Eq)]
enum Drain {
    /// The listener would block: nothing is left pending.
    Complete,
    /// Accepting failed with connections possibly still queued; try again
    /// after the pause.
    Deferred(Duration),
}

/// Accept until the listener would block.
///
/// mio readiness is edge-triggered, so every pending connection has to be
/// taken now or it will not be reported again. A `WouldBlock` on the very
/// first accept is a spurious wakeup and simply ends the drain. Errors that
/// only cost the connection being accepted do not end it either. Anything
/// else, descriptor exhaustion included, defers the rest of the drain.
fn accept_connections<A>(
    mut accept: A,
    registry: &Registry,
    connections: &mut ConnectionRegistry,
    counter: &ConnectionCounter,
) -> Drain
where
    A: FnMut() -> io::Result<(TcpStream, SocketAddr)>,
{
    loop {
        match accept() {
            Ok((stream, peer)) => {
                let id = counter.next_id();
                if let Err(e) = stream.set_nonblocking(true) {
                    debug!(conn = id, error = %e, "Failed to make connection non-blocking");
                    continue;
                }

                let fd = stream.as_raw_fd();
                let Some(key) = connections.insert(Connection::new(id, stream, peer)) else {
                    warn!(conn = id, peer = %peer, "Connection limit reached, closing");
                    continue;
                };

                if let Err(e) = registry.register(&mut SourceFd(&fd), Token(key), Interest::READABLE) {
                    // Dropping the removed connection closes the descriptor
                    warn!(conn = id, error = %e, "Failed to register connection, closing");
                    connections.remove(key);
                    continue;
                }

                debug!(conn = id, peer = %peer, key, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Complete,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if listener::is_connection_error(e) => {
                debug!(error = %e, "Connection failed during accept");
            }
            Err(e) => {
                warn!(error = %e, "Accept error, retrying later");
                return Drain::Deferred(listener::accept_backoff(&e).unwrap_or(ACCEPT_RETRY));
            }
        }
    }
}

/// Serve one ready connection on the loop thread, then deregister it.
///
/// The caller drops the connection afterwards, closing the descriptor only
/// once the poller no longer knows about it.
fn dispatch(
    registry: &Registry,
    conn: &mut Connection,
    handler: &dyn Handler,
    io_timeout: Option<Duration>,
) {
    match conn.prepare(io_timeout) {
        Ok(()) => serve(handler, conn),
        Err(e) => debug!(conn = conn.id(), error = %e, "Failed to configure connection"),
    }

    let fd = conn.as_raw_fd();
    if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
        debug!(conn = conn.id(), error = %e, "Failed to deregister connection");
    }
}
