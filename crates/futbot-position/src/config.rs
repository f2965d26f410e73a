//! Exit subsystem configuration.
//!
//! Loaded from the `[exit]` and `[matcher]` sections of the bot config;
//! every field has a default so partial tables are accepted.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Exiting service parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Breakeven offset beyond entry, in percent of entry price.
    pub breakeven_margin_percent: Decimal,

    /// TP level whose hit activates the trailing stop.
    pub trailing_activation_level: u8,

    /// Base trailing distance in percent of entry price.
    pub trailing_stop_percent: Decimal,

    /// Multiplier applied to ATR% when volatility-adaptive trailing is used.
    pub atr_multiplier: Decimal,

    /// Taker fee rate per side (0.0006 = 0.06%).
    pub fee_rate: Decimal,

    /// Relative tolerance (percent) when matching a partial exit price to a TP level.
    pub partial_price_tolerance_percent: Decimal,

    /// How far (percent) TP3 is pushed out when price approaches it.
    pub smart_tp3_extension_percent: Decimal,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            breakeven_margin_percent: dec!(0.3),
            trailing_activation_level: 2,
            trailing_stop_percent: dec!(1.0),
            atr_multiplier: dec!(1.0),
            fee_rate: dec!(0.0006),
            partial_price_tolerance_percent: dec!(1.0),
            smart_tp3_extension_percent: dec!(0.5),
        }
    }
}

/// Tolerances for resolving a TP fill event to a configured level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpMatcherConfig {
    /// Relative price tolerance, percent.
    pub price_tolerance_percent: Decimal,

    /// Allowed gap between filled percent and a level's size percent, in percentage points.
    pub quantity_tolerance_percent: Decimal,
}

impl Default for TpMatcherConfig {
    fn default() -> Self {
        Self {
            price_tolerance_percent: dec!(0.3),
            quantity_tolerance_percent: dec!(5),
        }
    }
}
