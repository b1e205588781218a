//! Structured logging using **tracing**.
//!
//! - Non-blocking: tracing macros push events to a queue, not directly to I/O.
//! - Async-compatible: works efficiently alongside the tokio-based assembly
//!   pipeline (`concurrency`, `assembler`).
//! - Rich context: structured fields (`module_id`, `apath`, `output`) are
//!   attached directly to events instead of being interpolated into message
//!   strings, so they survive machine parsing by observability platforms.
//!
//! The JSON subscriber provides machine-readable output for observability
//! platforms.

use std::path::Path;
use tracing::{error, info, warn};

/// Initializes the global tracing collector (subscriber).
///
/// This should be called *once* at the beginning of the application's runtime.
/// It configures structured JSON output to stderr.
///
/// # Environment Variables
/// - `RUST_LOG`: Controls log filtering (e.g., `RUST_LOG=bundler_core=debug`)
pub fn init_structured_logging() {
    tracing_subscriber::fmt()
        .json() // Output logs in JSON format
        .with_ansi(false) // Disable ANSI codes in JSON output
        .with_level(true) // Include the log level field
        .with_target(true) // Include the module path (target)
        .with_current_span(true) // Include tracing span context
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()) // Allow RUST_LOG env var
        .with_writer(std::io::stderr) // Write to stderr (keeps stdout clean for tool output)
        .init();
}

/// Logs a warning event.
pub fn log_warn(message: &str) {
    warn!(detail = %message);
}

/// Logs an info event.
pub fn log_info(message: &str) {
    info!(detail = %message);
}

/// Logs an error event.
pub fn log_error(message: &str) {
    error!(detail = %message);
}

/// Logs a custom event with a specific event name.
///
/// Preserved for call sites that don't need structured fields.
pub fn log_event(event: &str, detail: &str) {
    match event.to_uppercase().as_str() {
        "ERROR" => error!(event = %event, detail = %detail),
        "WARN" | "WARNING" => warn!(event = %event, detail = %detail),
        _ => info!(event = %event, detail = %detail),
    }
}

/// Logs a per-module event with `module_id` and `apath` attached as
/// structured fields, used by the cache and transformer on the hot path.
pub fn log_module_event(level: tracing::Level, module_id: i64, apath: &Path, detail: &str) {
    match level {
        tracing::Level::ERROR => {
            error!(module_id, apath = %apath.display(), detail = %detail)
        }
        tracing::Level::WARN => {
            warn!(module_id, apath = %apath.display(), detail = %detail)
        }
        _ => info!(module_id, apath = %apath.display(), detail = %detail),
    }
}

/// Logs a bundle-completion event with the output path attached.
pub fn log_bundle_complete(output: &Path, module_count: usize, error_count: usize) {
    info!(
        output = %output.display(),
        module_count,
        error_count,
        "bundle complete"
    );
}
