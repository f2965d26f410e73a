//! In-memory collaborators for paper trading and tests.
//!
//! These simulate the exchange, journal, session stats and notifier without
//! any network I/O. The exchange stub records every call and supports
//! injected failures and artificial latency so interleavings at await points
//! can be reproduced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use futbot_core::Price;

use crate::error::{ExchangeError, ExchangeResult, JournalError, NotifyError, StatsError};
use crate::ports::{
    ClosePositionRequest, ExchangeClient, JournalTrade, Notifier, SessionStats, TakeProfitAmender,
    TradeCloseRecord, TradeExitStats, TradeJournal, TradeStatus, TrailingStopCapability,
    TrailingStopRequest, UpdateStopLossRequest,
};

// =============================================================================
// Stub Exchange
// =============================================================================

/// Every call the stub exchange has received.
#[derive(Debug, Clone, Default)]
pub struct StubCalls {
    pub closes: Vec<ClosePositionRequest>,
    pub stop_loss_updates: Vec<UpdateStopLossRequest>,
    pub trailing_stops: Vec<TrailingStopRequest>,
    pub take_profit_amends: Vec<(String, Price)>,
    pub cancels: usize,
}

/// Stub exchange.
///
/// Closes and stop-loss updates succeed immediately unless a failure was
/// injected. Prices come from [`StubExchange::set_price`].
#[derive(Debug, Default)]
pub struct StubExchange {
    prices: RwLock<HashMap<String, Price>>,
    calls: Mutex<StubCalls>,
    fail_next_close: Mutex<Option<ExchangeError>>,
    fail_closes: AtomicBool,
    fail_next_stop_loss: Mutex<Option<ExchangeError>>,
    fail_cancels: AtomicBool,
    fail_prices: AtomicBool,
    latency_ms: AtomicU64,
    native_trailing: bool,
    amend_take_profit: bool,
}

impl StubExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise native trailing-stop support.
    #[must_use]
    pub fn with_native_trailing(mut self) -> Self {
        self.native_trailing = true;
        self
    }

    /// Advertise take-profit amendment support.
    #[must_use]
    pub fn with_take_profit_amend(mut self) -> Self {
        self.amend_take_profit = true;
        self
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    /// Delay every mutating call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fail the next close with `error`.
    pub fn fail_next_close(&self, error: ExchangeError) {
        *self.fail_next_close.lock() = Some(error);
    }

    /// Fail every close until reset.
    pub fn set_fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::Relaxed);
    }

    pub fn fail_next_stop_loss(&self, error: ExchangeError) {
        *self.fail_next_stop_loss.lock() = Some(error);
    }

    pub fn set_fail_cancels(&self, fail: bool) {
        self.fail_cancels.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_prices(&self, fail: bool) {
        self.fail_prices.store(fail, Ordering::Relaxed);
    }

    /// Snapshot of recorded calls.
    pub fn calls(&self) -> StubCalls {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.calls.lock().closes.len()
    }

    /// Closes that flattened the whole position.
    pub fn full_close_count(&self) -> usize {
        self.calls
            .lock()
            .closes
            .iter()
            .filter(|c| c.percentage >= Decimal::ONE_HUNDRED)
            .count()
    }

    pub fn stop_loss_update_count(&self) -> usize {
        self.calls.lock().stop_loss_updates.len()
    }

    pub fn cancel_count(&self) -> usize {
        self.calls.lock().cancels
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for StubExchange {
    async fn close_position(&self, request: ClosePositionRequest) -> ExchangeResult<()> {
        self.simulate_latency().await;
        self.calls.lock().closes.push(request.clone());

        if let Some(error) = self.fail_next_close.lock().take() {
            return Err(error);
        }
        if self.fail_closes.load(Ordering::Relaxed) {
            return Err(ExchangeError::Network("Simulated close failure".to_string()));
        }

        debug!(
            position_id = %request.position_id,
            percentage = %request.percentage,
            "Stub: position closed"
        );
        Ok(())
    }

    async fn update_stop_loss(&self, request: UpdateStopLossRequest) -> ExchangeResult<()> {
        self.simulate_latency().await;
        if let Some(error) = self.fail_next_stop_loss.lock().take() {
            return Err(error);
        }
        debug!(position_id = %request.position_id, new_price = %request.new_price, "Stub: stop-loss updated");
        self.calls.lock().stop_loss_updates.push(request);
        Ok(())
    }

    async fn cancel_all_conditional_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.calls.lock().cancels += 1;
        if self.fail_cancels.load(Ordering::Relaxed) {
            return Err(ExchangeError::Network("Simulated cancel failure".to_string()));
        }
        debug!(symbol, "Stub: conditional orders cancelled");
        Ok(())
    }

    async fn get_current_price(&self, symbol: &str) -> ExchangeResult<Price> {
        if self.fail_prices.load(Ordering::Relaxed) {
            return Err(ExchangeError::Network("Simulated price fetch failure".to_string()));
        }
        self.prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::PriceUnavailable(symbol.to_string()))
    }

    fn trailing_stop(&self) -> Option<&dyn TrailingStopCapability> {
        if self.native_trailing {
            Some(self)
        } else {
            None
        }
    }

    fn take_profit_amender(&self) -> Option<&dyn TakeProfitAmender> {
        if self.amend_take_profit {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl TrailingStopCapability for StubExchange {
    async fn set_trailing_stop(&self, request: TrailingStopRequest) -> ExchangeResult<()> {
        self.simulate_latency().await;
        self.calls.lock().trailing_stops.push(request);
        Ok(())
    }
}

#[async_trait]
impl TakeProfitAmender for StubExchange {
    async fn update_take_profit(&self, order_id: &str, new_price: Price) -> ExchangeResult<()> {
        self.simulate_latency().await;
        self.calls
            .lock()
            .take_profit_amends
            .push((order_id.to_string(), new_price));
        Ok(())
    }
}

// =============================================================================
// Memory Journal
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryJournal {
    trades: RwLock<HashMap<String, JournalTrade>>,
    closes: RwLock<Vec<TradeCloseRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a journal entry and return its id.
    pub fn open_trade(&self) -> String {
        let journal_id = Uuid::new_v4().to_string();
        self.trades.write().insert(
            journal_id.clone(),
            JournalTrade {
                journal_id: journal_id.clone(),
                status: TradeStatus::Open,
                exit_condition: None,
            },
        );
        journal_id
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn closes(&self) -> Vec<TradeCloseRecord> {
        self.closes.read().clone()
    }
}

#[async_trait]
impl TradeJournal for MemoryJournal {
    async fn get_trade(&self, journal_id: &str) -> Result<Option<JournalTrade>, JournalError> {
        Ok(self.trades.read().get(journal_id).cloned())
    }

    async fn record_trade_close(&self, record: TradeCloseRecord) -> Result<(), JournalError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(JournalError::Write("Simulated journal failure".to_string()));
        }
        {
            let mut trades = self.trades.write();
            let trade = trades
                .get_mut(&record.journal_id)
                .ok_or_else(|| JournalError::NotFound(record.journal_id.clone()))?;
            trade.status = TradeStatus::Closed;
            trade.exit_condition = Some(record.exit_type.to_string());
        }
        self.closes.write().push(record);
        Ok(())
    }
}

// =============================================================================
// Memory Session Stats
// =============================================================================

/// Aggregate over recorded exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub net_pnl: Decimal,
}

#[derive(Debug, Default)]
pub struct MemorySessionStats {
    exits: RwLock<Vec<(String, TradeExitStats)>>,
}

impl MemorySessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exits(&self) -> Vec<(String, TradeExitStats)> {
        self.exits.read().clone()
    }

    pub fn summary(&self) -> SessionSummary {
        self.exits
            .read()
            .iter()
            .fold(SessionSummary::default(), |mut acc, (_, stats)| {
                acc.trades += 1;
                if stats.pnl > Decimal::ZERO {
                    acc.wins += 1;
                } else if stats.pnl < Decimal::ZERO {
                    acc.losses += 1;
                }
                acc.net_pnl += stats.pnl;
                acc
            })
    }
}

#[async_trait]
impl SessionStats for MemorySessionStats {
    async fn update_trade_exit(
        &self,
        journal_id: &str,
        stats: TradeExitStats,
    ) -> Result<(), StatsError> {
        self.exits.write().push((journal_id.to_string(), stats));
        Ok(())
    }
}

// =============================================================================
// Notifiers
// =============================================================================

/// Notifier that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError> {
        info!(alert = text, "Notification");
        Ok(())
    }
}

/// Notifier that keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_alert(&self, text: &str) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(NotifyError::Delivery("Simulated delivery failure".to_string()));
        }
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}
