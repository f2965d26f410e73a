//! Exit action and exit type tagged unions.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

use crate::Price;

/// Operation requested from the exiting service.
///
/// Constructed per call and consumed immediately; carries no position state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitAction {
    /// Close `percent`% of the live quantity.
    ClosePercent { percent: Decimal },
    /// Close the whole remaining position.
    CloseAll,
    /// Move the stop-loss (ratcheted, favorable direction only).
    UpdateSl { new_stop_loss: Price },
    /// Start trailing at `trailing_percent` of the current price.
    ActivateTrailing { trailing_percent: Decimal },
    /// Move the stop-loss to entry plus the configured margin.
    MoveSlToBreakeven,
}

impl ExitAction {
    /// Short label used as a metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClosePercent { .. } => "close_percent",
            Self::CloseAll => "close_all",
            Self::UpdateSl { .. } => "update_sl",
            Self::ActivateTrailing { .. } => "activate_trailing",
            Self::MoveSlToBreakeven => "move_sl_to_breakeven",
        }
    }
}

/// Why a position (or a slice of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitType {
    StopLoss,
    TakeProfit { level: u8 },
    TrailingStop,
    TimeBased,
    Manual,
    External,
}

impl ExitType {
    /// Whether the exit was a loss-side stop (used for the `stopped_out` flag).
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::StopLoss)
    }

    /// Metric label without the TP level suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit { .. } => "take_profit",
            Self::TrailingStop => "trailing_stop",
            Self::TimeBased => "time_based",
            Self::Manual => "manual",
            Self::External => "external",
        }
    }
}

impl fmt::Display for ExitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::TakeProfit { level } => write!(f, "TAKE_PROFIT_{level}"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::TimeBased => write!(f, "TIME_BASED"),
            Self::Manual => write!(f, "MANUAL"),
            Self::External => write!(f, "EXTERNAL"),
        }
    }
}

impl Serialize for ExitType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
