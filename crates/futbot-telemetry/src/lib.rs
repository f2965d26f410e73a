//! Prometheus metrics and structured logging for futbot.
//!
//! - Prometheus metrics for exit actions, TP matching, stop-loss movement
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
