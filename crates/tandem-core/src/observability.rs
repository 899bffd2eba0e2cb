//! Observability infrastructure for tandem.
//!
//! Structured logging with consistent spans. Role transitions, lease events
//! and backend failures are logged with `lock_id`, `holder_id` and `node_id`
//! fields so a live/backup pair can be correlated from either side.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a log format name (`json` or `pretty`), case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tandem_node=debug`)
///
/// # Example
///
/// ```rust
/// use tandem_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for node manager operations.
///
/// # Example
///
/// ```rust
/// use tandem_core::observability::node_span;
///
/// let span = node_span("start_live_node", "broker-a", "live");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn node_span(operation: &str, node_id: &str, lock_id: &str) -> Span {
    tracing::info_span!("node", op = operation, node_id = node_id, lock_id = lock_id)
}

/// Creates a span for a single lock backend call.
#[must_use]
pub fn lock_span(operation: &str, lock_id: &str, holder_id: &str) -> Span {
    tracing::debug_span!(
        "lock",
        op = operation,
        lock_id = lock_id,
        holder_id = holder_id,
    )
}
