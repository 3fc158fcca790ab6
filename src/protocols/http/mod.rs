//! Demo HTTP/1.1 protocol.
//!
//! One request per connection; the runtime closes the connection after
//! the response is written.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /            200, empty body
//! GET  /echo/{s}    200, text/plain body {s}
//! POST /json        200, the posted object with "id" incremented
//!                   400 if the body is not JSON or "id" is not an unsigned int
//! *                 404
//! ```
//!
//! Requests are buffered up to a configurable size. Anything larger gets a
//! `413 Payload Too Large` rather than being silently truncated.

pub mod handler;
pub mod parser;

pub use handler::{route, HttpHandler, Response};
