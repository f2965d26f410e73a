//! Take-profit ledger: partial-fill bookkeeping for one position.

use rust_decimal::Decimal;
use tracing::debug;

use futbot_core::{PositionSide, Price, Size};

use crate::calc::{pnl_for, round_trip_fees};
use crate::ports::{FinalPnl, PartialCloseLedger};

/// One recorded partial fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialFill {
    pub level: u8,
    pub qty: Size,
    pub price: Price,
}

/// Ledger of partial TP fills.
///
/// Realized PnL is the sum of every partial slice plus the remainder at the
/// final exit price; fees are charged round-trip on every slice.
#[derive(Debug, Clone)]
pub struct TakeProfitLedger {
    side: PositionSide,
    entry_price: Price,
    initial_quantity: Size,
    fee_rate: Decimal,
    fills: Vec<PartialFill>,
}

impl TakeProfitLedger {
    pub fn new(side: PositionSide, entry_price: Price, initial_quantity: Size, fee_rate: Decimal) -> Self {
        Self {
            side,
            entry_price,
            initial_quantity,
            fee_rate,
            fills: Vec::new(),
        }
    }

    pub fn fills(&self) -> &[PartialFill] {
        &self.fills
    }

    /// Quantity not yet closed by a partial fill.
    pub fn remaining_quantity(&self) -> Size {
        let closed = self
            .fills
            .iter()
            .fold(Size::ZERO, |acc, fill| acc + fill.qty);
        self.initial_quantity.saturating_sub(closed)
    }

    /// Realized PnL of the partial fills only.
    pub fn realized_partial_pnl(&self) -> FinalPnl {
        self.fills.iter().fold(FinalPnl::default(), |acc, fill| {
            let gross = pnl_for(self.side, self.entry_price, fill.price, fill.qty);
            let fees = round_trip_fees(self.entry_price, fill.price, fill.qty, self.fee_rate);
            FinalPnl {
                pnl_gross: acc.pnl_gross + gross,
                pnl_net: acc.pnl_net + gross - fees,
                fees: acc.fees + fees,
            }
        })
    }
}

impl PartialCloseLedger for TakeProfitLedger {
    fn record_partial_close(&mut self, level: u8, qty: Size, price: Price) {
        let qty = if qty > self.remaining_quantity() {
            self.remaining_quantity()
        } else {
            qty
        };
        debug!(level, %qty, %price, "Ledger: partial close recorded");
        self.fills.push(PartialFill { level, qty, price });
    }

    fn calculate_final_pnl(&self, exit_price: Price) -> FinalPnl {
        let partial = self.realized_partial_pnl();
        let remainder = self.remaining_quantity();
        let gross = pnl_for(self.side, self.entry_price, exit_price, remainder);
        let fees = round_trip_fees(self.entry_price, exit_price, remainder, self.fee_rate);
        FinalPnl {
            pnl_gross: partial.pnl_gross + gross,
            pnl_net: partial.pnl_net + gross - fees,
            fees: partial.fees + fees,
        }
    }

    fn tp_levels_hit(&self) -> Vec<u8> {
        let mut levels: Vec<u8> = self.fills.iter().map(|f| f.level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }
}
