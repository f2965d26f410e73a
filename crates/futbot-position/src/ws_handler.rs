//! WebSocket event handler.
//!
//! Entry point for exchange push events. Every event type has its own arm
//! in an exhaustive match; malformed frames are logged and skipped so a bad
//! message never halts the stream.
//!
//! Position-closed handling runs entirely inside the repository's atomic
//! close lock, which serializes it against the time-based exit path.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use futbot_core::{parse_wire_decimal, ExitType, Position, Price, SharedPosition, Size};
use futbot_telemetry::Metrics;

use crate::error::ValidationError;
use crate::exiting::PositionExitingService;
use crate::ports::TradeStatus;
use crate::repository::{CloseReason, PositionRepository};
use crate::tp_matcher::{TpFill, TpLevelMatcher};
use crate::validator::{validate_ws_update, PositionSnapshot};

/// Order fill as pushed by the exchange. Numerics arrive untyped.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFillEvent {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub avg_price: Option<Value>,
    #[serde(default)]
    pub cum_exec_qty: Option<Value>,
}

/// Validated fill fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFill {
    pub order_id: String,
    pub avg_price: Option<Price>,
    pub cum_exec_qty: Option<Size>,
}

impl OrderFillEvent {
    /// Non-empty order id; avg price and filled quantity, when present,
    /// must be finite and non-negative.
    pub fn validate(&self) -> Result<ValidatedFill, ValidationError> {
        let mut violations = Vec::new();
        if self.order_id.trim().is_empty() {
            violations.push("orderId is empty".to_string());
        }

        let mut numeric = |name: &str, value: &Option<Value>| -> Option<Decimal> {
            let value = value.as_ref().filter(|v| !v.is_null())?;
            match parse_wire_decimal(value) {
                Some(d) if d >= Decimal::ZERO => Some(d),
                _ => {
                    violations.push(format!("{name} must be a finite non-negative number (got {value})"));
                    None
                }
            }
        };
        let avg_price = numeric("avgPrice", &self.avg_price);
        let cum_exec_qty = numeric("cumExecQty", &self.cum_exec_qty);

        if violations.is_empty() {
            Ok(ValidatedFill {
                order_id: self.order_id.trim().to_string(),
                avg_price: avg_price.map(Price::new).filter(Price::is_positive),
                cum_exec_qty: cum_exec_qty.map(Size::new).filter(Size::is_positive),
            })
        } else {
            Err(ValidationError { violations })
        }
    }
}

/// Exchange push events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsEvent {
    PositionUpdate { position: PositionSnapshot },
    PositionClosed,
    OrderFilled(OrderFillEvent),
    TakeProfitFilled(OrderFillEvent),
    StopLossFilled(OrderFillEvent),
    Error { message: String },
}

pub struct WebSocketEventHandler {
    repository: Arc<PositionRepository>,
    service: Arc<PositionExitingService>,
    matcher: TpLevelMatcher,
}

impl WebSocketEventHandler {
    pub fn new(
        repository: Arc<PositionRepository>,
        service: Arc<PositionExitingService>,
        matcher: TpLevelMatcher,
    ) -> Self {
        Self {
            repository,
            service,
            matcher,
        }
    }

    /// Dispatch one event. Never fails; the return value says whether the
    /// event changed anything.
    pub async fn handle(&self, event: WsEvent) -> bool {
        match event {
            WsEvent::PositionUpdate { position } => self.handle_position_update(&position),
            WsEvent::PositionClosed => self.handle_position_closed().await,
            WsEvent::OrderFilled(fill) => {
                self.handle_order_filled(&fill);
                false
            }
            WsEvent::TakeProfitFilled(fill) => self.handle_take_profit_filled(&fill).await,
            WsEvent::StopLossFilled(fill) => {
                self.handle_stop_loss_filled(&fill);
                false
            }
            WsEvent::Error { message } => {
                self.handle_error(&message);
                false
            }
        }
    }

    pub fn handle_position_update(&self, snapshot: &PositionSnapshot) -> bool {
        match validate_ws_update(snapshot) {
            Ok(update) => {
                let outcome = self.repository.sync_with_websocket(&update);
                debug!(position_id = %update.id, ?outcome, "WS position update");
                true
            }
            Err(e) => {
                warn!(error = %e, "Malformed WS position update skipped");
                Metrics::validation_rejected("ws_position_update");
                false
            }
        }
    }

    /// Record and clean up a position the exchange reports as closed.
    pub async fn handle_position_closed(&self) -> bool {
        self.repository
            .close_position_with_atomic_lock("ws_position_closed", |current| async move {
                let Some(position) = current else {
                    debug!("Position closed event with no tracked position, already handled");
                    return false;
                };
                let snapshot = position.snapshot();

                if self.journal_shows_closed(&snapshot).await {
                    debug!(position_id = %snapshot.id, "Journal already shows trade closed, skipping");
                    self.repository.clear_position();
                    return false;
                }

                let exit_price = self.exit_price(&snapshot).await;
                let exit_type = self.exit_type(&snapshot);
                let closed = self
                    .service
                    .close_full_position(
                        &position,
                        exit_price,
                        "exchange reported position closed",
                        exit_type,
                    )
                    .await;
                if !closed && !position.is_closed() {
                    // close was rejected and the position reopened
                    warn!(position_id = %snapshot.id, "Close failed, keeping position tracked");
                    return false;
                }
                if !closed {
                    info!(position_id = %snapshot.id, "Close already handled by another path");
                }

                self.repository.clear_position();
                closed
            })
            .await
    }

    async fn journal_shows_closed(&self, snapshot: &Position) -> bool {
        let Some(journal_id) = snapshot.journal_id.as_deref() else {
            return false;
        };
        match self.service.journal().get_trade(journal_id).await {
            Ok(Some(trade)) => trade.status == TradeStatus::Closed,
            Ok(None) => false,
            Err(e) => {
                warn!(journal_id, error = %e, "Journal lookup failed, continuing with close");
                false
            }
        }
    }

    /// Current price, falling back to entry when it cannot be fetched.
    async fn exit_price(&self, snapshot: &Position) -> Price {
        match self.service.exchange().get_current_price(&snapshot.symbol).await {
            Ok(price) if price.is_positive() => price,
            Ok(price) => {
                warn!(symbol = %snapshot.symbol, %price, "Invalid current price, using entry price");
                snapshot.entry_price
            }
            Err(e) => {
                warn!(symbol = %snapshot.symbol, error = %e, "Price fetch failed, using entry price");
                snapshot.entry_price
            }
        }
    }

    /// Exit type from the tracked close reason, not from local TP flags.
    fn exit_type(&self, snapshot: &Position) -> ExitType {
        match self.repository.last_close_reason() {
            Some(CloseReason::TakeProfit) => {
                let level = snapshot
                    .take_profits
                    .iter()
                    .filter(|tp| !tp.hit)
                    .map(|tp| tp.level)
                    .min()
                    .or_else(|| snapshot.hit_levels().last().copied())
                    .unwrap_or(1);
                ExitType::TakeProfit { level }
            }
            Some(CloseReason::Trailing) => ExitType::TrailingStop,
            Some(CloseReason::StopLoss) => ExitType::StopLoss,
            Some(CloseReason::TimeBased) => ExitType::TimeBased,
            None => ExitType::External,
        }
    }

    /// Resolve the filled TP level and apply the hit.
    pub async fn handle_take_profit_filled(&self, event: &OrderFillEvent) -> bool {
        let fill = match event.validate() {
            Ok(fill) => fill,
            Err(e) => {
                warn!(error = %e, "Malformed TP fill event skipped");
                Metrics::validation_rejected("ws_tp_fill");
                return false;
            }
        };
        let Some(position) = self.repository.get_current_position() else {
            debug!(order_id = %fill.order_id, "TP fill with no tracked position");
            return false;
        };
        let snapshot = position.snapshot();

        let tp_fill = TpFill {
            order_id: Some(fill.order_id.clone()),
            fill_price: fill.avg_price,
            filled_qty: fill.cum_exec_qty,
        };
        let Some(matched) = self.matcher.resolve(&snapshot, &tp_fill) else {
            error!(
                position_id = %snapshot.id,
                order_id = %fill.order_id,
                "CRITICAL: TP fill could not be resolved to any level, event dropped"
            );
            return false;
        };

        self.repository.set_last_close_reason(CloseReason::TakeProfit);
        let price = fill
            .avg_price
            .or_else(|| snapshot.take_profit(matched.level).map(|tp| tp.price))
            .unwrap_or(snapshot.entry_price);
        self.service
            .on_take_profit_hit(&position, matched.level, price)
            .await
    }

    /// Logged only; the consequence arrives as a position-closed event.
    pub fn handle_order_filled(&self, event: &OrderFillEvent) {
        info!(
            order_id = %event.order_id,
            symbol = ?event.symbol,
            avg_price = ?event.avg_price,
            cum_exec_qty = ?event.cum_exec_qty,
            "Order filled"
        );
    }

    /// Logged and tagged; recording happens on the position-closed event.
    pub fn handle_stop_loss_filled(&self, event: &OrderFillEvent) {
        let trailing = self
            .repository
            .get_current_position()
            .map(|p| p.read(|p| p.stop_loss.is_trailing))
            .unwrap_or(false);
        let reason = if trailing {
            CloseReason::Trailing
        } else {
            CloseReason::StopLoss
        };
        self.repository.set_last_close_reason(reason);
        info!(order_id = %event.order_id, ?reason, "Stop-loss filled, awaiting position close event");
    }

    /// Logged only; reconnection belongs to the connection owner.
    pub fn handle_error(&self, message: &str) {
        error!(message, "WebSocket error event");
    }

    pub fn current_position(&self) -> Option<SharedPosition> {
        self.repository.get_current_position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExitConfig, TpMatcherConfig};
    use crate::error::ExchangeError;
    use crate::exiting::ExitDeps;
    use crate::stub::{MemoryJournal, MemorySessionStats, RecordingNotifier, StubExchange};
    use futbot_core::{ManualClock, PositionSide, TakeProfit};
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Harness {
        handler: WebSocketEventHandler,
        repository: Arc<PositionRepository>,
        exchange: Arc<StubExchange>,
        journal: Arc<MemoryJournal>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let exchange = Arc::new(StubExchange::new());
        let journal = Arc::new(MemoryJournal::new());
        let repository = Arc::new(PositionRepository::new(clock.clone()));
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: journal.clone(),
                stats: Arc::new(MemorySessionStats::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                clock,
            },
            ExitConfig::default(),
        ));
        Harness {
            handler: WebSocketEventHandler::new(
                repository.clone(),
                service,
                TpLevelMatcher::new(TpMatcherConfig::default()),
            ),
            repository,
            exchange,
            journal,
        }
    }

    fn open(h: &Harness) -> SharedPosition {
        let journal_id = h.journal.open_trade();
        h.repository.open_position(
            Position::open(
                "BTCUSDT",
                PositionSide::Long,
                Price::new(dec!(100)),
                Size::new(dec!(10)),
                dec!(10),
                Price::new(dec!(95)),
                vec![
                    TakeProfit::new(1, dec!(5), dec!(33), Price::new(dec!(105))).with_order_id("tp-1"),
                    TakeProfit::new(2, dec!(10), dec!(33), Price::new(dec!(110))).with_order_id("tp-2"),
                ],
                0,
            )
            .with_journal_id(journal_id),
        )
    }

    #[test]
    fn test_event_wire_format() {
        let event: WsEvent = serde_json::from_value(json!({
            "type": "takeProfitFilled",
            "orderId": "tp-1",
            "avgPrice": "105.1",
            "cumExecQty": 3.3
        }))
        .unwrap();
        let WsEvent::TakeProfitFilled(fill) = event else {
            panic!("wrong variant");
        };
        let fill = fill.validate().unwrap();
        assert_eq!(fill.avg_price, Some(Price::new(dec!(105.1))));
        assert_eq!(fill.cum_exec_qty, Some(Size::new(dec!(3.3))));

        let event: WsEvent = serde_json::from_value(json!({"type": "positionClosed"})).unwrap();
        assert_eq!(event, WsEvent::PositionClosed);
    }

    #[test]
    fn test_fill_validation() {
        let bad = OrderFillEvent {
            order_id: " ".into(),
            avg_price: Some(json!("NaN")),
            cum_exec_qty: Some(json!(-1)),
            ..Default::default()
        };
        let err = bad.validate().unwrap_err();
        assert_eq!(err.violations.len(), 3);

        let minimal = OrderFillEvent {
            order_id: "x".into(),
            ..Default::default()
        };
        let fill = minimal.validate().unwrap();
        assert!(fill.avg_price.is_none());
    }

    #[tokio::test]
    async fn test_malformed_update_skipped() {
        let h = harness();
        let pos = open(&h);
        let snapshot = PositionSnapshot::from_value(json!({
            "id": "BTCUSDT_LONG", "symbol": "BTCUSDT", "entryPrice": "", "quantity": "NaN"
        }))
        .unwrap();
        assert!(!h.handler.handle(WsEvent::PositionUpdate { position: snapshot }).await);
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(10)));
    }

    #[tokio::test]
    async fn test_update_syncs_quantity_not_entry() {
        let h = harness();
        let pos = open(&h);
        let snapshot = PositionSnapshot::from_value(json!({
            "id": "BTCUSDT_LONG", "symbol": "BTCUSDT", "entryPrice": "101", "quantity": "6.7",
            "unrealizedPnL": "12"
        }))
        .unwrap();
        assert!(h.handler.handle(WsEvent::PositionUpdate { position: snapshot }).await);
        let snap = pos.snapshot();
        assert_eq!(snap.quantity, Size::new(dec!(6.7)));
        assert_eq!(snap.entry_price, Price::new(dec!(100)));
    }

    #[tokio::test]
    async fn test_tp_fill_by_order_id() {
        let h = harness();
        let pos = open(&h);
        let fill = OrderFillEvent {
            order_id: "tp-2".into(),
            avg_price: Some(json!("105")),
            ..Default::default()
        };
        assert!(h.handler.handle(WsEvent::TakeProfitFilled(fill)).await);
        let snap = pos.snapshot();
        assert!(snap.take_profit(2).unwrap().hit);
        assert!(!snap.take_profit(1).unwrap().hit);
        assert_eq!(h.repository.last_close_reason(), Some(CloseReason::TakeProfit));
    }

    #[tokio::test]
    async fn test_tp_fill_unresolvable_is_dropped() {
        let h = harness();
        let pos = open(&h);
        pos.update(|p| {
            for tp in &mut p.take_profits {
                tp.mark_hit(1);
            }
        });
        let fill = OrderFillEvent {
            order_id: "unknown".into(),
            ..Default::default()
        };
        assert!(!h.handler.handle(WsEvent::TakeProfitFilled(fill)).await);
    }

    #[tokio::test]
    async fn test_position_closed_records_and_clears() {
        let h = harness();
        open(&h);
        h.exchange.set_price("BTCUSDT", Price::new(dec!(94.5)));
        h.handler.handle_stop_loss_filled(&OrderFillEvent {
            order_id: "sl-1".into(),
            ..Default::default()
        });

        assert!(h.handler.handle(WsEvent::PositionClosed).await);
        assert!(!h.repository.has_position());

        let closes = h.journal.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].exit_type, ExitType::StopLoss);
        assert_eq!(closes[0].exit_price, Price::new(dec!(94.5)));
        assert!(closes[0].stopped_out);

        // duplicate event: nothing tracked any more
        assert!(!h.handler.handle(WsEvent::PositionClosed).await);
        assert_eq!(h.exchange.full_close_count(), 1);
    }

    #[tokio::test]
    async fn test_position_closed_keeps_position_when_close_fails() {
        let h = harness();
        let pos = open(&h);
        h.exchange.set_price("BTCUSDT", Price::new(dec!(101)));
        h.exchange
            .fail_next_close(ExchangeError::Network("timeout".into()));

        assert!(!h.handler.handle(WsEvent::PositionClosed).await);
        assert!(h.repository.has_position());
        assert!(!pos.is_closed());
        assert!(h.journal.closes().is_empty());

        // the redelivered event completes the close
        assert!(h.handler.handle(WsEvent::PositionClosed).await);
        assert!(!h.repository.has_position());
        assert_eq!(h.journal.closes().len(), 1);
    }

    #[tokio::test]
    async fn test_position_closed_price_fallback_to_entry() {
        let h = harness();
        open(&h);
        h.exchange.set_fail_prices(true);
        assert!(h.handler.handle_position_closed().await);
        let closes = h.journal.closes();
        assert_eq!(closes[0].exit_price, Price::new(dec!(100)));
        assert_eq!(closes[0].exit_type, ExitType::External);
    }

    #[tokio::test]
    async fn test_position_closed_skipped_when_journal_closed() {
        let h = harness();
        let pos = open(&h);
        h.exchange.set_price("BTCUSDT", Price::new(dec!(100)));
        // another path already recorded the trade
        let journal_id = pos.snapshot().journal_id.unwrap();
        crate::ports::TradeJournal::record_trade_close(
            h.journal.as_ref(),
            crate::ports::TradeCloseRecord {
                journal_id,
                position_id: pos.id(),
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                exit_type: ExitType::Manual,
                exit_reason: "manual".into(),
                exit_price: Price::new(dec!(100)),
                quantity: Size::new(dec!(10)),
                realized_pnl: Decimal::ZERO,
                pnl_percent: Decimal::ZERO,
                fees: Decimal::ZERO,
                tp_levels_hit: vec![],
                holding_time_ms: 0,
                holding_time_minutes: Decimal::ZERO,
                holding_time_hours: Decimal::ZERO,
                stopped_out: false,
                sl_moved_to_breakeven: false,
                trailing_stop_activated: false,
                closed_at: 0,
            },
        )
        .await
        .unwrap();

        assert!(!h.handler.handle_position_closed().await);
        assert_eq!(h.exchange.close_count(), 0);
        assert_eq!(h.journal.closes().len(), 1);
        assert!(!h.repository.has_position());
    }

    #[tokio::test]
    async fn test_logging_only_events() {
        let h = harness();
        let pos = open(&h);
        let fill = OrderFillEvent {
            order_id: "o-1".into(),
            ..Default::default()
        };
        assert!(!h.handler.handle(WsEvent::OrderFilled(fill.clone())).await);
        assert!(!h.handler.handle(WsEvent::StopLossFilled(fill)).await);
        assert!(!h.handler.handle(WsEvent::Error { message: "socket reset".into() }).await);
        assert!(!pos.is_closed());
        assert_eq!(h.exchange.close_count(), 0);
    }
}
