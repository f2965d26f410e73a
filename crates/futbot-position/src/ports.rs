//! Collaborator ports consumed by the exit subsystem.
//!
//! The exchange client, trade journal, session statistics and notifier are
//! external. The core only sees these traits; adapters live elsewhere
//! (see [`crate::stub`] for in-memory implementations).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use futbot_core::{ExitType, PositionSide, Price, Size};

use crate::error::{ExchangeResult, JournalError, NotifyError, StatsError};

// =============================================================================
// Exchange
// =============================================================================

/// Close `percentage`% of the position on the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosePositionRequest {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStopLossRequest {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub new_price: Price,
}

/// Native exchange trailing stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrailingStopRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub activation_price: Price,
    pub trailing_percent: Decimal,
}

/// Exchange operations used by the exit paths.
///
/// `AlreadyClosed`/`ReduceOnlyRejected` errors are recovered as success by
/// the callers; every other error fails the enclosing operation.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn close_position(&self, request: ClosePositionRequest) -> ExchangeResult<()>;

    async fn update_stop_loss(&self, request: UpdateStopLossRequest) -> ExchangeResult<()>;

    async fn cancel_all_conditional_orders(&self, symbol: &str) -> ExchangeResult<()>;

    async fn get_current_price(&self, symbol: &str) -> ExchangeResult<Price>;

    /// Native trailing stop support, if the venue has it.
    fn trailing_stop(&self) -> Option<&dyn TrailingStopCapability> {
        None
    }

    /// In-place take-profit amendment support, if the venue has it.
    fn take_profit_amender(&self) -> Option<&dyn TakeProfitAmender> {
        None
    }
}

#[async_trait]
pub trait TrailingStopCapability: Send + Sync {
    async fn set_trailing_stop(&self, request: TrailingStopRequest) -> ExchangeResult<()>;
}

#[async_trait]
pub trait TakeProfitAmender: Send + Sync {
    async fn update_take_profit(&self, order_id: &str, new_price: Price) -> ExchangeResult<()>;
}

// =============================================================================
// Journal
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Journal view of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalTrade {
    pub journal_id: String,
    pub status: TradeStatus,
    pub exit_condition: Option<String>,
}

/// Payload written to the journal when a trade closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeCloseRecord {
    pub journal_id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub exit_type: ExitType,
    pub exit_reason: String,
    pub exit_price: Price,
    pub quantity: Size,
    pub realized_pnl: Decimal,
    pub pnl_percent: Decimal,
    pub fees: Decimal,
    pub tp_levels_hit: Vec<u8>,
    pub holding_time_ms: u64,
    pub holding_time_minutes: Decimal,
    pub holding_time_hours: Decimal,
    pub stopped_out: bool,
    pub sl_moved_to_breakeven: bool,
    pub trailing_stop_activated: bool,
    pub closed_at: u64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TradeJournal: Send + Sync {
    async fn get_trade(&self, journal_id: &str) -> Result<Option<JournalTrade>, JournalError>;

    async fn record_trade_close(&self, record: TradeCloseRecord) -> Result<(), JournalError>;
}

// =============================================================================
// Session stats
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossSummary {
    pub initial: Price,
    #[serde(rename = "final")]
    pub final_price: Price,
    pub moved_to_breakeven: bool,
    pub trailing_activated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExitStats {
    pub exit_price: Price,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_type: ExitType,
    pub tp_hit_levels: Vec<u8>,
    pub holding_time_ms: u64,
    pub stop_loss: StopLossSummary,
}

#[async_trait]
pub trait SessionStats: Send + Sync {
    async fn update_trade_exit(&self, journal_id: &str, stats: TradeExitStats)
        -> Result<(), StatsError>;
}

// =============================================================================
// Notifier
// =============================================================================

/// Operator notification channel. Failures are swallowed by callers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError>;
}

// =============================================================================
// Partial-close ledger
// =============================================================================

/// Net result of a trade including every partial fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinalPnl {
    pub pnl_gross: Decimal,
    pub pnl_net: Decimal,
    pub fees: Decimal,
}

/// Bookkeeping of partial TP fills for one position.
///
/// Owned by the position lifecycle and only invoked from the serialized exit
/// path, so it takes `&mut self` and carries no lock of its own.
pub trait PartialCloseLedger: Send {
    fn record_partial_close(&mut self, level: u8, qty: Size, price: Price);

    /// Total PnL if the remainder closes at `exit_price`.
    fn calculate_final_pnl(&self, exit_price: Price) -> FinalPnl;

    /// Levels with a recorded fill, ascending and unique.
    fn tp_levels_hit(&self) -> Vec<u8>;
}
