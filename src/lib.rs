//! dispatchd: a minimal HTTP server built around interchangeable
//! connection dispatch strategies.
//!
//! - `runtime`: listener, bounded task queue, worker pool,
//!   thread-per-connection and readiness event loop
//! - `handler`: the capability each strategy invokes per connection
//! - `protocols`: concrete handlers (HTTP demo endpoints)
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod handler;
pub mod protocols;
pub mod runtime;

pub use config::{Config, ConfigError, DispatchMode, OverflowPolicy};
pub use handler::Handler;
pub use runtime::{Connection, Server, SetupError, ShutdownHandle};
