//! HTTP request handler plugged into the dispatch runtime.

use super::parser::{self, ParseResult, RequestHead};
use crate::handler::Handler;
use crate::runtime::Connection;
use bytes::BytesMut;
use serde_json::Value;
use std::io::{self, Read, Write};
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

const INVALID_JSON: &str = r#"{"error":"Invalid JSON"}"#;
const INVALID_ID: &str =
    r#"{"error":"Invalid Object. Missing 'id' field or 'id' field should be int"}"#;

/// A response ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: &'static str,
    content_type: Option<&'static str>,
    body: Vec<u8>,
}

impl Response {
    fn empty(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            content_type: None,
            body: Vec::new(),
        }
    }

    fn with_body(status: u16, reason: &'static str, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            reason,
            content_type: Some(content_type),
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).into_bytes();
        if let Some(content_type) = self.content_type {
            out.extend_from_slice(
                format!(
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                    self.body.len()
                )
                .as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Serves `GET /`, `GET /echo/{text}` and `POST /json`.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    max_request_size: usize,
}

impl HttpHandler {
    pub fn new(max_request_size: usize) -> Self {
        Self { max_request_size }
    }

    /// Read one request from `conn`.
    ///
    /// The buffer grows as needed but never past `max_request_size`.
    fn read_request<R: Read>(&self, conn: &mut R) -> io::Result<Incoming> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK.min(self.max_request_size));
        let mut chunk = [0u8; READ_CHUNK];
        let mut head: Option<RequestHead> = None;

        loop {
            if head.is_none() {
                match parser::parse(&buf) {
                    ParseResult::Complete(parsed) => head = Some(parsed),
                    ParseResult::Incomplete => {}
                    ParseResult::Invalid(reason) => {
                        debug!(reason, "Malformed request");
                        return Ok(Incoming::Reject(Response::empty(400, "Bad Request")));
                    }
                }
            }

            match head {
                Some(ref parsed) => match parsed.total_len() {
                    Some(total) if total <= self.max_request_size => {
                        if buf.len() >= total {
                            let mut body = buf.split_off(parsed.head_len);
                            body.truncate(parsed.content_length);
                            return Ok(Incoming::Request(parsed.clone(), body));
                        }
                    }
                    // Over the cap, or too large to even add up
                    _ => return Ok(Incoming::Reject(Response::empty(413, "Payload Too Large"))),
                },
                None if buf.len() >= self.max_request_size => {
                    return Ok(Incoming::Reject(Response::empty(413, "Payload Too Large")));
                }
                None => {}
            }

            // Never past the cap: the checks above stop before buf is full
            let want = (self.max_request_size - buf.len()).min(READ_CHUNK);
            let n = conn.read(&mut chunk[..want])?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(Incoming::Closed);
                }
                return Ok(Incoming::Reject(Response::empty(400, "Bad Request")));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Outcome of reading from a connection.
#[derive(Debug)]
enum Incoming {
    /// A complete request head and its body.
    Request(RequestHead, BytesMut),
    /// The request cannot be served; answer with this response.
    Reject(Response),
    /// The peer closed without sending anything.
    Closed,
}

impl Handler for HttpHandler {
    fn handle(&self, conn: &mut Connection) -> io::Result<()> {
        let response = match self.read_request(conn)? {
            Incoming::Closed => {
                trace!(conn = conn.id(), "Peer closed before sending a request");
                return Ok(());
            }
            Incoming::Request(head, body) => {
                debug!(conn = conn.id(), method = %head.method, path = %head.path, "Request");
                route(&head, &body)
            }
            Incoming::Reject(response) => response,
        };

        conn.write_all(&response.to_bytes())?;
        conn.flush()
    }
}

/// Produce the response for a complete request.
pub fn route(head: &RequestHead, body: &[u8]) -> Response {
    match (head.method.as_str(), head.path.as_str()) {
        ("GET", "/") => Response::empty(200, "OK"),
        ("GET", path) if path.starts_with("/echo/") => Response::with_body(
            200,
            "OK",
            "text/plain",
            path["/echo/".len()..].as_bytes().to_vec(),
        ),
        ("POST", "/json") => bump_id(body),
        _ => Response::empty(404, "Not Found"),
    }
}

/// Return the posted JSON object with its `id` incremented.
fn bump_id(body: &[u8]) -> Response {
    let mut value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return json_error(INVALID_JSON),
    };

    let bumped = value
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| id.checked_add(1));

    match (value.as_object_mut(), bumped) {
        (Some(object), Some(id)) => {
            object.insert("id".to_string(), Value::from(id));
            match serde_json::to_vec(&value) {
                Ok(out) => Response::with_body(200, "OK", "application/json", out),
                Err(_) => json_error(INVALID_JSON),
            }
        }
        _ => json_error(INVALID_ID),
    }
}

fn json_error(body: &str) -> Response {
    Response::with_body(400, "Bad Request", "application/json", body.as_bytes().to_vec())
}
