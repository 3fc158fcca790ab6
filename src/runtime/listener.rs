//! Listening socket setup and accept error classification.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

/// How long the acceptor pauses when the process is out of descriptors.
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(50);

/// Fatal errors while bringing up the server.
#[derive(Debug)]
pub enum SetupError {
    /// The listen address did not parse.
    Address(String),
    Socket(io::Error),
    ReuseAddr(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Address(addr) => write!(f, "Invalid listen address '{addr}'"),
            SetupError::Socket(e) => write!(f, "Socket creation failed: {e}"),
            SetupError::ReuseAddr(e) => write!(f, "SO_REUSEADDR failed: {e}"),
            SetupError::Bind(addr, e) => write!(f, "Bind to {addr} failed: {e}"),
            SetupError::Listen(e) => write!(f, "Listen failed: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Address(_) => None,
            SetupError::Socket(e)
            | SetupError::ReuseAddr(e)
            | SetupError::Bind(_, e)
            | SetupError::Listen(e) => Some(e),
        }
    }
}

/// Create a listening TCP socket with `SO_REUSEADDR` set.
///
/// The socket is left in blocking mode; the event loop switches it to
/// non-blocking itself.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SetupError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(SetupError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(SetupError::ReuseAddr)?;
    socket
        .bind(&addr.into())
        .map_err(|e| SetupError::Bind(addr, e))?;
    socket.listen(backlog).map_err(SetupError::Listen)?;

    Ok(socket.into())
}

/// Parse a listen address such as `0.0.0.0:4221`.
pub fn parse_addr(listen: &str) -> Result<SocketAddr, SetupError> {
    listen
        .parse()
        .map_err(|_| SetupError::Address(listen.to_string()))
}

/// Decide how the acceptor reacts to a failed `accept()`.
///
/// Every accept failure is local to the connection being accepted. When the
/// process or system has run out of descriptors or memory, returns a short
/// pause so the acceptor does not spin on the same error.
pub fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            Some(EXHAUSTION_BACKOFF)
        }
        _ => None,
    }
}

/// Whether a failed `accept()` only lost the connection being accepted.
///
/// The listener itself is fine after these, so the acceptor can go straight
/// on to the next pending connection.
pub fn is_connection_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::PermissionDenied => true,
        _ => matches!(
            e.raw_os_error(),
            Some(libc::EPROTO)
                | Some(libc::ENETDOWN)
                | Some(libc::ENETUNREACH)
                | Some(libc::EHOSTDOWN)
                | Some(libc::EHOSTUNREACH)
                | Some(libc::ENOPROTOOPT)
                | Some(libc::EOPNOTSUPP)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_create_listener_accepts() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        let (_stream, peer) = listener.accept().unwrap();
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_bind_conflict_reported() {
        // SO_REUSEADDR does not allow two listeners on the same port
        let first = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = first.local_addr().unwrap();

        match create_listener(addr, 16) {
            Err(err @ SetupError::Bind(..)) => {
                assert!(err.to_string().starts_with("Bind to"));
            }
            other => panic!("expected bind failure, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(
            parse_addr("0.0.0.0:4221").unwrap(),
            "0.0.0.0:4221".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(parse_addr("nope"), Err(SetupError::Address(_))));
    }

    #[test]
    fn test_accept_backoff() {
        let exhausted = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(accept_backoff(&exhausted), Some(EXHAUSTION_BACKOFF));

        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), None);
    }

    #[test]
    fn test_connection_errors_classified() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_connection_error(&io::Error::from_raw_os_error(libc::EPROTO)));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_connection_error(&io::Error::from_raw_os_error(libc::EBADF)));
    }
}
