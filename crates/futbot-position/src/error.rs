//! Error types for the exit subsystem.
//!
//! Exit-critical operations report `bool`; these errors describe what a
//! collaborator returned so the failure can be logged and classified.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Invalid position state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

pub type PositionResult<T> = Result<T, PositionError>;

/// Errors reported by the exchange client.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Position size is already zero on the exchange.
    #[error("Position already closed: {0}")]
    AlreadyClosed(String),

    /// Reduce-only order rejected because nothing is left to reduce.
    #[error("Reduce-only order rejected: {0}")]
    ReduceOnlyRejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("Capability not supported: {0}")]
    Unsupported(&'static str),
}

impl ExchangeError {
    /// Whether this error means the exchange already flattened the position.
    ///
    /// These are recovered locally as a successful close.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed(_) | Self::ReduceOnlyRejected(_))
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone, Error)]
pub enum JournalError {
    #[error("Trade not found: {0}")]
    NotFound(String),

    #[error("Journal write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Error)]
pub enum StatsError {
    #[error("Session stats update failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Aggregated validation failure: every violation, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Position validation failed: {}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn contains(&self, needle: &str) -> bool {
        self.violations.iter().any(|v| v.contains(needle))
    }
}

/// Ladder configuration rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LadderConfigError {
    #[error("Ladder needs at least one level")]
    NoLevels,

    #[error("Level {level}: price percent must be > 0, got {value}")]
    InvalidPricePercent { level: usize, value: Decimal },

    #[error("Level {level}: close percent must be within [10, 90], got {value}")]
    InvalidClosePercent { level: usize, value: Decimal },

    #[error("Trailing distance percent must be > 0 when trailing is enabled, got {0}")]
    InvalidTrailingDistance(Decimal),

    #[error("Ladder supports at most 255 levels, got {0}")]
    TooManyLevels(usize),
}
