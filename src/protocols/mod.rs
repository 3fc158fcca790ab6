//! Protocol implementations.
//!
//! Each protocol provides a `Handler` that the runtime invokes once per
//! accepted connection.
//!
//! - `http`: minimal HTTP/1.1 with echo and JSON endpoints

pub mod http;
