//! Request handler capability injected into every dispatch strategy.

use crate::runtime::Connection;
use std::io;

/// Serves one connection: reads a request, writes a response.
///
/// The runtime never inspects request bytes. The connection is closed by
/// the runtime after `handle` returns, whatever the outcome.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, conn: &mut Connection) -> io::Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&mut Connection) -> io::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, conn: &mut Connection) -> io::Result<()> {
        self(conn)
    }
}
