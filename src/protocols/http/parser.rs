//! HTTP/1.x request head parser.
//!
//! Understands just enough of the request to route it: the request line
//! and a `Content-Length` header. Everything else is skipped.

/// A request whose head (request line and headers) has been parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Declared body length, 0 if absent.
    pub content_length: usize,
    /// Bytes consumed by the head, including the blank line.
    pub head_len: usize,
}

impl RequestHead {
    /// Total bytes needed for head plus body.
    ///
    /// `None` when the declared `Content-Length` does not fit in memory at all.
    pub fn total_len(&self) -> Option<usize> {
        self.head_len.checked_add(self.content_length)
    }
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Head fully parsed; the body may still be incomplete.
    Complete(RequestHead),
    /// Need more data for the head.
    Incomplete,
    /// Malformed request line or header.
    Invalid(&'static str),
}

/// Parse the request head at the start of `input`.
pub fn parse(input: &[u8]) -> ParseResult {
    let head_end = match find_head_end(input) {
        Some(pos) => pos,
        None => return ParseResult::Incomplete,
    };

    let head = match std::str::from_utf8(&input[..head_end]) {
        Ok(s) => s,
        Err(_) => return ParseResult::Invalid("request head is not valid UTF-8"),
    };

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return ParseResult::Invalid("malformed request line"),
    };

    let mut content_length = 0;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return ParseResult::Invalid("malformed header");
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = match value.trim().parse() {
                Ok(len) => len,
                Err(_) => return ParseResult::Invalid("invalid Content-Length"),
            };
        }
    }

    ParseResult::Complete(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        content_length,
        head_len: head_end + 4, // head + \r\n\r\n
    })
}

/// Find \r\n\r\n in buffer, returning the position of the first \r.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        match parse(b"GET /echo/abc HTTP/1.1\r\nHost: localhost\r\n\r\n") {
            ParseResult::Complete(head) => {
                assert_eq!(head.method, "GET");
                assert_eq!(head.path, "/echo/abc");
                assert_eq!(head.content_length, 0);
                assert_eq!(head.head_len, 43);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_content_length() {
        let input = b"POST /json HTTP/1.1\r\ncontent-length: 12\r\n\r\n{\"id\":";
        match parse(input) {
            ParseResult::Complete(head) => {
                assert_eq!(head.content_length, 12);
                assert_eq!(head.total_len(), Some(head.head_len + 12));
                assert!(Some(input.len()) < head.total_len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_content_length_overflow() {
        let input = format!("POST /json HTTP/1.1\r\nContent-Length: {}\r\n\r\n", usize::MAX);
        match parse(input.as_bytes()) {
            ParseResult::Complete(head) => {
                assert_eq!(head.content_length, usize::MAX);
                assert_eq!(head.total_len(), None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_head() {
        match parse(b"GET / HTTP/1.1\r\nHost: x\r\n") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_requests() {
        for input in [
            &b"GET\r\n\r\n"[..],
            b"GET / HTTP/1.1\r\nno-colon\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
        ] {
            match parse(input) {
                ParseResult::Invalid(_) => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
