//! Poll-path position events.
//!
//! The monitor raises these from price ticks. SL and TP hits here are backup
//! detections only: the exchange-side orders are authoritative and their
//! fills arrive through the WebSocket handler. Time-based exits and external
//! closes act.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use futbot_core::{ExitType, Price, SharedPosition};

use crate::exiting::PositionExitingService;
use crate::ports::ClosePositionRequest;
use crate::repository::{CloseReason, PositionRepository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionEvent {
    StopLossHit {
        position_id: String,
        price: Price,
    },
    TakeProfitHit {
        position_id: String,
        level: u8,
        price: Price,
    },
    TimeBasedExit {
        position_id: String,
        price: Price,
        holding_time_ms: u64,
    },
    ClosedExternally {
        position_id: String,
        reason: String,
    },
}

impl PositionEvent {
    pub fn position_id(&self) -> &str {
        match self {
            Self::StopLossHit { position_id, .. }
            | Self::TakeProfitHit { position_id, .. }
            | Self::TimeBasedExit { position_id, .. }
            | Self::ClosedExternally { position_id, .. } => position_id,
        }
    }
}

pub struct PositionEventHandler {
    repository: Arc<PositionRepository>,
    service: Arc<PositionExitingService>,
}

impl PositionEventHandler {
    pub fn new(repository: Arc<PositionRepository>, service: Arc<PositionExitingService>) -> Self {
        Self {
            repository,
            service,
        }
    }

    pub async fn handle(&self, event: PositionEvent) -> bool {
        match event {
            PositionEvent::StopLossHit { position_id, price } => {
                self.handle_stop_loss_hit(&position_id, price);
                false
            }
            PositionEvent::TakeProfitHit {
                position_id,
                level,
                price,
            } => {
                self.handle_take_profit_hit(&position_id, level, price);
                false
            }
            PositionEvent::TimeBasedExit {
                position_id,
                price,
                holding_time_ms,
            } => {
                self.handle_time_based_exit(&position_id, price, holding_time_ms)
                    .await
            }
            PositionEvent::ClosedExternally {
                position_id,
                reason,
            } => match self.tracked(&position_id) {
                Some(position) => {
                    self.handle_position_closed_externally(&position, &reason)
                        .await
                }
                None => false,
            },
        }
    }

    fn tracked(&self, position_id: &str) -> Option<SharedPosition> {
        self.repository
            .get_current_position()
            .filter(|p| p.id() == position_id)
    }

    pub fn handle_stop_loss_hit(&self, position_id: &str, price: Price) {
        warn!(position_id, %price, "Stop-loss crossed locally, waiting for exchange fill");
    }

    pub fn handle_take_profit_hit(&self, position_id: &str, level: u8, price: Price) {
        info!(position_id, level, %price, "TP level crossed locally, waiting for exchange fill");
    }

    /// Close on the exchange and let the WS position-closed event record it.
    ///
    /// Falls back to a full local close when the exchange call fails.
    pub async fn handle_time_based_exit(
        &self,
        position_id: &str,
        last_price: Price,
        holding_time_ms: u64,
    ) -> bool {
        self.repository
            .close_position_with_atomic_lock("time_based_exit", |current| async move {
                let Some(position) = current.filter(|p| p.id() == position_id) else {
                    debug!(position_id, "Time-based exit for untracked position ignored");
                    return false;
                };
                if position.is_closed() {
                    debug!(position_id, "Time-based exit on closed position ignored");
                    return false;
                }

                self.repository.set_last_close_reason(CloseReason::TimeBased);
                let snapshot = position.snapshot();
                info!(
                    position_id,
                    holding_time_ms,
                    %last_price,
                    "Max holding time reached, closing position"
                );

                let request = ClosePositionRequest {
                    position_id: snapshot.id.clone(),
                    symbol: snapshot.symbol.clone(),
                    side: snapshot.side,
                    percentage: Decimal::ONE_HUNDRED,
                };
                match self.service.exchange().close_position(request).await {
                    Ok(()) => {
                        info!(position_id, "Time-based close sent, awaiting exchange confirmation");
                        true
                    }
                    Err(e) if e.is_already_closed() => {
                        info!(position_id, "Position already closed on exchange");
                        true
                    }
                    Err(e) => {
                        error!(position_id, error = %e, "Time-based close failed, closing locally");
                        let closed = self
                            .service
                            .close_full_position(
                                &position,
                                last_price,
                                "time-based exit fallback",
                                ExitType::TimeBased,
                            )
                            .await;
                        if closed {
                            self.repository.clear_position();
                        }
                        closed
                    }
                }
            })
            .await
    }

    /// Forget a position closed outside the bot and tell the operator.
    pub async fn handle_position_closed_externally(
        &self,
        position: &SharedPosition,
        reason: &str,
    ) -> bool {
        let position_id = position.id();
        let cleared = match self.repository.get_current_position() {
            Some(current) if current.same_as(position) => {
                self.repository.clear_position();
                true
            }
            _ => false,
        };
        info!(position_id = %position_id, reason, cleared, "Position closed externally");
        self.service
            .notify(&format!("Position {position_id} closed externally: {reason}"))
            .await;
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitConfig;
    use crate::error::ExchangeError;
    use crate::exiting::ExitDeps;
    use crate::stub::{MemoryJournal, MemorySessionStats, RecordingNotifier, StubExchange};
    use futbot_core::{ManualClock, Position, PositionSide, Size};
    use rust_decimal_macros::dec;

    struct Harness {
        handler: PositionEventHandler,
        repository: Arc<PositionRepository>,
        exchange: Arc<StubExchange>,
        journal: Arc<MemoryJournal>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let exchange = Arc::new(StubExchange::new());
        let journal = Arc::new(MemoryJournal::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let repository = Arc::new(PositionRepository::new(clock.clone()));
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: journal.clone(),
                stats: Arc::new(MemorySessionStats::new()),
                notifier: notifier.clone(),
                clock,
            },
            ExitConfig::default(),
        ));
        Harness {
            handler: PositionEventHandler::new(repository.clone(), service),
            repository,
            exchange,
            journal,
            notifier,
        }
    }

    fn open(h: &Harness) -> SharedPosition {
        let journal_id = h.journal.open_trade();
        h.repository.open_position(
            Position::open(
                "ETHUSDT",
                PositionSide::Short,
                Price::new(dec!(2000)),
                Size::new(dec!(1)),
                dec!(5),
                Price::new(dec!(2100)),
                vec![],
                0,
            )
            .with_journal_id(journal_id),
        )
    }

    #[tokio::test]
    async fn test_backup_hits_only_log() {
        let h = harness();
        let pos = open(&h);
        let id = pos.id();
        assert!(
            !h.handler
                .handle(PositionEvent::StopLossHit {
                    position_id: id.clone(),
                    price: Price::new(dec!(2101)),
                })
                .await
        );
        assert!(
            !h.handler
                .handle(PositionEvent::TakeProfitHit {
                    position_id: id,
                    level: 1,
                    price: Price::new(dec!(1900)),
                })
                .await
        );
        assert_eq!(h.exchange.close_count(), 0);
        assert!(!pos.is_closed());
    }

    #[tokio::test]
    async fn test_time_based_exit_defers_to_ws() {
        let h = harness();
        let pos = open(&h);
        let closed = h
            .handler
            .handle(PositionEvent::TimeBasedExit {
                position_id: pos.id(),
                price: Price::new(dec!(1990)),
                holding_time_ms: 3_600_000,
            })
            .await;
        assert!(closed);
        assert_eq!(h.exchange.full_close_count(), 1);
        assert_eq!(h.repository.last_close_reason(), Some(CloseReason::TimeBased));
        // still tracked and open; the WS close event finishes the job
        assert!(h.repository.has_position());
        assert!(!pos.is_closed());
        assert!(h.journal.closes().is_empty());
    }

    #[tokio::test]
    async fn test_time_based_exit_fallback() {
        let h = harness();
        let pos = open(&h);
        h.exchange.fail_next_close(ExchangeError::Network("timeout".into()));
        let closed = h
            .handler
            .handle_time_based_exit(&pos.id(), Price::new(dec!(1990)), 3_600_000)
            .await;
        assert!(closed);
        assert!(pos.is_closed());
        assert!(!h.repository.has_position());
        let closes = h.journal.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].exit_type, ExitType::TimeBased);
        assert_eq!(closes[0].exit_price, Price::new(dec!(1990)));
    }

    #[tokio::test]
    async fn test_time_based_exit_fallback_failure_keeps_tracking() {
        let h = harness();
        let pos = open(&h);
        h.exchange.set_fail_closes(true);
        let closed = h
            .handler
            .handle_time_based_exit(&pos.id(), Price::new(dec!(1990)), 3_600_000)
            .await;
        assert!(!closed);
        assert!(!pos.is_closed());
        assert!(h.repository.has_position());
    }

    #[tokio::test]
    async fn test_time_based_exit_wrong_id_ignored() {
        let h = harness();
        open(&h);
        assert!(
            !h.handler
                .handle_time_based_exit("BTCUSDT_LONG", Price::new(dec!(1)), 1)
                .await
        );
        assert_eq!(h.exchange.close_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_externally_clears_and_notifies() {
        let h = harness();
        let pos = open(&h);
        let cleared = h
            .handler
            .handle(PositionEvent::ClosedExternally {
                position_id: pos.id(),
                reason: "liquidated".into(),
            })
            .await;
        assert!(cleared);
        assert!(!h.repository.has_position());
        assert_eq!(h.exchange.close_count(), 0);
        assert!(h.notifier.messages()[0].contains("liquidated"));
    }
}
