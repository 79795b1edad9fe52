//! Process-wide tracing setup shared by the engine binaries.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize tracing with JSON output and `RUST_LOG` filtering.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::from_env());
}
