//! # Observability
//!
//! Logging setup for the dispatch binaries.
//!
//! Services call [`init`] or [`init_with_config`] once at startup and then log
//! with plain `tracing` macros. Where lines go is decided here:
//!
//! - a human-readable (or JSON) stream on stderr
//! - optionally, structured JSONL appended to a shared file, by default
//!   `~/.dispatch/logs/dispatch.jsonl`
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "dispatch".into(),
//!     default_level: "debug".into(),
//!     log_path: Some(observability::default_log_path()),
//!     ..Default::default()
//! })?;
//! ```

mod file;
mod jsonl;

pub use file::{default_log_path, CentralLogWriter};
pub use jsonl::JsonlLayer;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every JSONL line.
    pub service_name: String,

    /// Default filter (e.g. "info", "dispatch_webhooks=debug").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// Append JSONL to this file as well.
    pub log_path: Option<PathBuf>,

    /// Emit logs to stderr.
    pub also_stderr: bool,

    /// Format stderr output as JSON instead of the compact text format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "dispatch".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
            json: false,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging to stderr at the default level.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened. Calling it twice leaves the first
/// subscriber in place.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let file_layer = match &config.log_path {
        Some(path) => {
            let writer = CentralLogWriter::open(path)?;
            Some(
                JsonlLayer::new(config.service_name.clone(), writer)
                    .with_filter(env_filter(&config.default_level)),
            )
        }
        None => None,
    };

    let stderr_layer = config.also_stderr.then(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(io::stderr);
        let layer = if config.json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        };
        layer.with_filter(env_filter(&config.default_level))
    });

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            service = %config.service_name,
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
    Ok(())
}
