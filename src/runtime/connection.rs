//! Accepted client connections.
//!
//! A `Connection` owns the socket from accept until it is dropped, which
//! closes it. Ownership moves from the acceptor to the dispatch strategy
//! and, for the pool, on to a worker, so the socket is closed exactly once
//! by whoever finishes with it last.

use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr) -> Self {
        Self { id, peer, stream }
    }

    /// Diagnostic identifier, unique per dispatch strategy.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Put the socket in blocking mode with the given read/write timeout.
    ///
    /// Handlers always see a blocking stream; the timeout bounds how long
    /// a silent peer can hold a worker or the event loop.
    pub fn prepare(&self, io_timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(io_timeout)?;
        self.stream.set_write_timeout(io_timeout)?;
        Ok(())
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// A connection queued for a pool worker.
#[derive(Debug)]
pub struct Task {
    conn: Connection,
    accepted_at: Instant,
}

impl Task {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            accepted_at: Instant::now(),
        }
    }

    /// Time spent between accept and now.
    pub fn queued_for(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// Count of accepted connections.
///
/// Diagnostic only: ids are unique, but nothing depends on their order.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    accepted: AtomicU64,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accept and return the new connection's id.
    pub fn next_id(&self) -> u64 {
        self.accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Connections currently registered with the event loop's poller.
///
/// Keys double as poll tokens. A connection is present from the moment it
/// is registered until its handler is dispatched, never longer.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a connection, returning its key.
    ///
    /// Returns `None` (dropping and closing the connection) if the registry
    /// is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Remove a connection, handing ownership back to the caller.
    pub fn remove(&mut self, key: usize) -> Option<Connection> {
        self.connections.try_remove(key)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Build a connected (server side, client side) pair over loopback.
    fn loopback_pair(id: u64) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (Connection::new(id, stream, peer), client)
    }

    #[test]
    fn test_connection_read_write() {
        let (mut conn, mut client) = loopback_pair(7);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.peer(), client.local_addr().unwrap());

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_prepare_restores_blocking_with_timeout() {
        let (mut conn, _client) = loopback_pair(1);
        conn.stream.set_nonblocking(true).unwrap();

        conn.prepare(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(
            conn.stream.read_timeout().unwrap(),
            Some(Duration::from_millis(20))
        );

        // Blocking read that times out rather than returning WouldBlock at once
        let start = Instant::now();
        let mut buf = [0u8; 1];
        assert!(conn.read(&mut buf).is_err());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_connection_counter() {
        let counter = ConnectionCounter::new();
        assert_eq!(counter.accepted(), 0);
        assert_eq!(counter.next_id(), 1);
        assert_eq!(counter.next_id(), 2);
        assert_eq!(counter.accepted(), 2);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let (c1, _k1) = loopback_pair(1);
        let (c2, _k2) = loopback_pair(2);
        let (c3, mut k3) = loopback_pair(3);

        let id1 = registry.insert(c1).unwrap();
        let id2 = registry.insert(c2).unwrap();

        // At capacity: the rejected connection is closed
        assert!(registry.insert(c3).is_none());
        let mut buf = [0u8; 1];
        assert_eq!(k3.read(&mut buf).unwrap(), 0);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        let removed = registry.remove(id1).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove(id2).unwrap().id(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_task_into_connection() {
        let (conn, _client) = loopback_pair(9);
        let task = Task::new(conn);
        assert!(task.queued_for() < Duration::from_secs(5));
        assert_eq!(task.into_connection().id(), 9);
    }
}
