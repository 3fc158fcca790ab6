//! Thread-per-connection dispatch.
//!
//! Every accepted connection gets its own detached thread. There is no
//! limit on concurrent connections beyond what the OS allows, and no
//! backpressure on the acceptor.

use super::{accept_loop, serve, ConnectionCounter, ShutdownHandle};
use crate::config::Config;
use crate::handler::Handler;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use tracing::error;

pub(super) fn run(
    listener: &TcpListener,
    config: &Config,
    handler: Arc<dyn Handler>,
    shutdown: &ShutdownHandle,
) -> io::Result<()> {
    let counter = ConnectionCounter::new();

    accept_loop(listener, config, shutdown, &counter, |mut conn| {
        let id = conn.id();
        let handler = Arc::clone(&handler);

        // The JoinHandle is dropped right away, detaching the thread. If the
        // spawn fails the closure, and the connection with it, is dropped.
        let spawned = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || serve(handler.as_ref(), &mut conn));

        if let Err(e) = spawned {
            error!(conn = id, error = %e, "Failed to spawn connection thread, closing");
        }
    })
}
