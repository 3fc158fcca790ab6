//! dispatchd: a minimal HTTP server
//!
//! Serves a handful of demo endpoints with one of three dispatch modes:
//! - `thread_pool`: fixed worker pool behind a bounded task queue
//! - `threads`: one thread per connection
//! - `epoll`: single-threaded readiness event loop
//!
//! Configuration via CLI arguments or TOML file.

use dispatchd::protocols::http::HttpHandler;
use dispatchd::{Config, ConfigError, Server};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Help(e)) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = %config.mode,
        listen = %config.listen,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        overflow = ?config.overflow,
        io_timeout_ms = config.io_timeout_ms,
        "Starting dispatchd"
    );

    let handler = HttpHandler::new(config.max_request_size);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match server.run(handler) {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
