//! Take-profit level matcher.
//!
//! Resolves a TP fill event to a configured level. Exchange fill events do
//! not always carry a usable order id, so resolution walks an ordered list
//! of tiers and stops at the first match:
//!
//! 1. order id (authoritative)
//! 2. fill price within a relative tolerance of a level's price
//! 3. filled-quantity percentage against the first unhit level's size
//! 4. last resort: first unhit level, logged at error level

use std::fmt;

use rust_decimal::Decimal;
use tracing::{debug, error};

use futbot_core::{Position, Price, Size};
use futbot_telemetry::Metrics;

use crate::config::TpMatcherConfig;

/// Tier that resolved a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    OrderId,
    Price,
    Quantity,
    LastResort,
}

impl MatchTier {
    /// Evaluation order.
    pub const ORDERED: [MatchTier; 4] = [
        MatchTier::OrderId,
        MatchTier::Price,
        MatchTier::Quantity,
        MatchTier::LastResort,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::OrderId => "order_id",
            Self::Price => "price",
            Self::Quantity => "quantity",
            Self::LastResort => "last_resort",
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fields of a fill event usable for matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpFill {
    pub order_id: Option<String>,
    pub fill_price: Option<Price>,
    pub filled_qty: Option<Size>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpMatch {
    pub level: u8,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, Default)]
pub struct TpLevelMatcher {
    config: TpMatcherConfig,
}

impl TpLevelMatcher {
    pub fn new(config: TpMatcherConfig) -> Self {
        Self { config }
    }

    /// Resolve `fill` against the position's TP ladder.
    ///
    /// Returns `None` only when every tier fails, which means no unhit
    /// level is left.
    pub fn resolve(&self, position: &Position, fill: &TpFill) -> Option<TpMatch> {
        let resolved = MatchTier::ORDERED.iter().find_map(|tier| {
            self.match_tier(*tier, position, fill)
                .map(|level| TpMatch { level, tier: *tier })
        });

        match resolved {
            Some(m) if m.tier == MatchTier::LastResort => {
                error!(
                    position_id = %position.id,
                    level = m.level,
                    order_id = ?fill.order_id,
                    fill_price = ?fill.fill_price,
                    filled_qty = ?fill.filled_qty,
                    "TP level forced to first unhit level: event carried no usable match data"
                );
                Metrics::tp_matched(m.tier.label());
            }
            Some(m) => {
                debug!(position_id = %position.id, level = m.level, tier = %m.tier, "TP level resolved");
                Metrics::tp_matched(m.tier.label());
            }
            None => Metrics::tp_matched("unresolved"),
        }
        resolved
    }

    fn match_tier(&self, tier: MatchTier, position: &Position, fill: &TpFill) -> Option<u8> {
        match tier {
            MatchTier::OrderId => self.match_order_id(position, fill),
            MatchTier::Price => self.match_price(position, fill),
            MatchTier::Quantity => self.match_quantity(position, fill),
            MatchTier::LastResort => first_unhit(position),
        }
    }

    fn match_order_id(&self, position: &Position, fill: &TpFill) -> Option<u8> {
        let order_id = fill.order_id.as_deref().filter(|id| !id.is_empty())?;
        position
            .take_profits
            .iter()
            .find(|tp| tp.order_id.as_deref() == Some(order_id))
            .map(|tp| tp.level)
    }

    /// Closest level within tolerance. Hit levels are included so a
    /// duplicate fill resolves to the level it already hit.
    fn match_price(&self, position: &Position, fill: &TpFill) -> Option<u8> {
        let price = fill.fill_price.filter(Price::is_positive)?;
        position
            .take_profits
            .iter()
            .filter_map(|tp| {
                price
                    .abs_pct_from(tp.price)
                    .filter(|diff| *diff <= self.config.price_tolerance_percent)
                    .map(|diff| (diff, tp.level))
            })
            .min_by_key(|(diff, _)| *diff)
            .map(|(_, level)| level)
    }

    fn match_quantity(&self, position: &Position, fill: &TpFill) -> Option<u8> {
        let filled = fill.filled_qty.filter(Size::is_positive)?;
        let pre_fill = position.quantity + filled;
        if pre_fill.is_zero() {
            return None;
        }
        let percent_filled = filled.inner() / pre_fill.inner() * Decimal::ONE_HUNDRED;
        position
            .take_profits
            .iter()
            .filter(|tp| !tp.hit)
            .find(|tp| (tp.size_percent - percent_filled).abs() <= self.config.quantity_tolerance_percent)
            .map(|tp| tp.level)
    }
}

fn first_unhit(position: &Position) -> Option<u8> {
    position
        .take_profits
        .iter()
        .filter(|tp| !tp.hit)
        .min_by_key(|tp| tp.level)
        .map(|tp| tp.level)
}
