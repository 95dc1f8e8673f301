//! Shared utilities for avatarlink: logging, error types, wire protocol.
//!
//! This crate provides common infrastructure used by the client library and the CLI.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
///
/// Noisy transport internals (`webrtc`, `hyper`) are capped at `warn` unless
/// `RUST_LOG` says otherwise.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{default_level},webrtc=warn,webrtc_ice=warn,hyper=warn,reqwest=warn"
        ))
    });

    // A second initialisation (tests, embedders) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
