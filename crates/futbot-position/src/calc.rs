//! Exit calculations.
//!
//! Pure functions over a [`Position`] snapshot: breakeven price, trailing
//! distance, TP/SL hit tests, PnL and partial-close size arithmetic.
//! No state, no I/O.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use futbot_core::{Position, PositionSide, Price, Size};

/// Lower clamp for trailing distance, percent of entry.
pub const MIN_TRAILING_PERCENT: Decimal = dec!(0.1);

/// Upper clamp for trailing distance, percent of entry.
pub const MAX_TRAILING_PERCENT: Decimal = dec!(5.0);

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Side-signed PnL breakdown for an exit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPnl {
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
}

/// Breakeven stop: entry shifted `margin_percent`% into profit.
pub fn calculate_breakeven_sl(position: &Position, margin_percent: Decimal) -> Price {
    let entry = position.entry_price.inner();
    let offset = entry * margin_percent / HUNDRED;
    Price::new(entry + position.side.sign() * offset)
}

/// Whether a proposed breakeven stop sits on the profitable side of entry.
pub fn is_breakeven_valid(position: &Position, proposed: Price) -> bool {
    match position.side {
        PositionSide::Long => proposed >= position.entry_price,
        PositionSide::Short => proposed <= position.entry_price,
    }
}

/// Absolute trailing distance.
///
/// ATR% times `atr_multiplier` when a positive ATR% is supplied, otherwise
/// `base_percent`; clamped to [0.1%, 5.0%] of entry before conversion.
pub fn calculate_trailing_distance(
    position: &Position,
    base_percent: Decimal,
    atr_percent: Option<Decimal>,
    atr_multiplier: Decimal,
) -> Decimal {
    let percent = match atr_percent {
        Some(atr) if atr > Decimal::ZERO => atr * atr_multiplier,
        _ => base_percent,
    };
    let clamped = percent.clamp(MIN_TRAILING_PERCENT, MAX_TRAILING_PERCENT);
    position.entry_price.inner() * clamped / HUNDRED
}

/// Trailing stop candidate at `distance` behind `current_price`.
pub fn calculate_current_trailing_sl(
    position: &Position,
    current_price: Price,
    distance: Decimal,
) -> Price {
    Price::new(current_price.inner() - position.side.sign() * distance)
}

/// Whether price moved further in the favorable direction since the last
/// trailing update.
pub fn should_update_trailing_sl(
    position: &Position,
    current_price: Price,
    last_trailing_price: Price,
    distance: Decimal,
) -> bool {
    if distance <= Decimal::ZERO {
        return false;
    }
    position
        .side
        .is_more_favorable(current_price, last_trailing_price)
}

pub fn is_tp_hit(position: &Position, current_price: Price, tp_price: Price) -> bool {
    match position.side {
        PositionSide::Long => current_price >= tp_price,
        PositionSide::Short => current_price <= tp_price,
    }
}

pub fn is_stop_loss_hit(position: &Position, current_price: Price) -> bool {
    let sl = position.stop_loss.price;
    match position.side {
        PositionSide::Long => current_price <= sl,
        PositionSide::Short => current_price >= sl,
    }
}

/// Side-signed PnL on the live quantity.
pub fn calculate_pnl(position: &Position, exit_price: Price) -> Decimal {
    pnl_for(position.side, position.entry_price, exit_price, position.quantity)
}

/// Side-signed percent move from entry. Losses are negative for both sides.
pub fn calculate_pnl_percent(position: &Position, exit_price: Price) -> Decimal {
    if position.entry_price.is_zero() {
        return Decimal::ZERO;
    }
    (exit_price - position.entry_price) / position.entry_price.inner()
        * HUNDRED
        * position.side.sign()
}

pub fn calculate_exit_pnl(position: &Position, exit_price: Price) -> ExitPnl {
    ExitPnl {
        pnl: calculate_pnl(position, exit_price),
        pnl_percent: calculate_pnl_percent(position, exit_price),
    }
}

/// Side-signed PnL for an arbitrary slice.
pub fn pnl_for(side: PositionSide, entry: Price, exit: Price, qty: Size) -> Decimal {
    (exit - entry) * qty.inner() * side.sign()
}

/// Entry plus exit notional times the per-side fee rate.
pub fn round_trip_fees(entry: Price, exit: Price, qty: Size, fee_rate: Decimal) -> Decimal {
    (qty.notional(entry) + qty.notional(exit)) * fee_rate
}

/// `quantity * size_percent / 100` on the live quantity.
pub fn calculate_size_to_close(position: &Position, size_percent: Decimal) -> Size {
    position.quantity.percent(size_percent)
}

/// Quantity left after closing `size_to_close`, never negative.
pub fn calculate_remaining_size(position: &Position, size_to_close: Size) -> Size {
    position.quantity.saturating_sub(size_to_close)
}

/// Quantity expected after every hit level's slice of the original size is gone.
pub fn expected_quantity_after_hits(position: &Position) -> Size {
    let closed_percent: Decimal = position
        .take_profits
        .iter()
        .filter(|tp| tp.hit)
        .map(|tp| tp.size_percent)
        .sum();
    position
        .initial_quantity
        .saturating_sub(position.initial_quantity.percent(closed_percent))
}

/// Relative distance in percent between two prices, or `None` if `reference` is zero.
pub fn relative_diff_percent(price: Price, reference: Price) -> Option<Decimal> {
    price.abs_pct_from(reference)
}
