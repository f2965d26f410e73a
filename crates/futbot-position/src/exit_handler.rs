//! Config-driven exit event handler.
//!
//! Same actions as the exiting service's TP transitions, but what happens on
//! each level comes from a declarative [`ExitStrategyConfig`] instead of
//! hardcoded level numbers.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use futbot_core::{ExitType, PositionSide, Price, SharedPosition, TakeProfit};

use crate::calc::calculate_trailing_distance;
use crate::exiting::PositionExitingService;

/// What to do when a level is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpHitAction {
    MoveToBreakeven,
    ActivateTrailing,
    ClosePosition,
}

/// Per-level exit behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpLevelConfig {
    pub level: u8,
    /// Distance from entry, percent.
    pub profit_percent: Decimal,
    /// Share of the original quantity closed at this level, percent.
    pub size_percent: Decimal,
    #[serde(default)]
    pub on_hit: Vec<TpHitAction>,
    #[serde(default)]
    pub breakeven_margin_percent: Option<Decimal>,
    #[serde(default)]
    pub trailing_percent: Option<Decimal>,
}

/// Declarative exit strategy shared read-only by every position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStrategyConfig {
    #[serde(default)]
    pub levels: Vec<TpLevelConfig>,
}

impl ExitStrategyConfig {
    pub fn level(&self, level: u8) -> Option<&TpLevelConfig> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// TP ladder for a new position at `entry`.
    pub fn build_take_profits(&self, entry: Price, side: PositionSide) -> Vec<TakeProfit> {
        self.levels
            .iter()
            .map(|l| {
                let offset = entry.inner() * l.profit_percent / Decimal::ONE_HUNDRED;
                let price = Price::new(entry.inner() + side.sign() * offset);
                TakeProfit::new(l.level, l.profit_percent, l.size_percent, price)
            })
            .collect()
    }
}

/// Generic exit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitEvent {
    TakeProfitHit { level: u8, price: Price },
    PositionClosed {
        price: Price,
        exit_type: ExitType,
        reason: String,
    },
}

pub struct ExitEventHandler {
    service: Arc<PositionExitingService>,
    strategy: Arc<ExitStrategyConfig>,
}

impl ExitEventHandler {
    pub fn new(service: Arc<PositionExitingService>, strategy: Arc<ExitStrategyConfig>) -> Self {
        Self { service, strategy }
    }

    /// Route `event` to the configured actions. Returns whether anything was applied.
    pub async fn handle(&self, position: &SharedPosition, event: ExitEvent) -> bool {
        match event {
            ExitEvent::TakeProfitHit { level, price } => {
                self.handle_take_profit_hit(position, level, price).await
            }
            ExitEvent::PositionClosed {
                price,
                exit_type,
                reason,
            } => {
                self.service
                    .close_full_position(position, price, &reason, exit_type)
                    .await
            }
        }
    }

    async fn handle_take_profit_hit(&self, position: &SharedPosition, level: u8, price: Price) -> bool {
        let Some(level_config) = self.strategy.level(level) else {
            warn!(position_id = %position.id(), level, "TP hit for unconfigured level");
            return false;
        };
        if self
            .service
            .record_take_profit_hit(position, level, price)
            .is_none()
        {
            return false;
        }
        info!(position_id = %position.id(), level, %price, actions = ?level_config.on_hit, "Configured TP hit");

        for action in &level_config.on_hit {
            match action {
                TpHitAction::MoveToBreakeven => {
                    let margin = level_config
                        .breakeven_margin_percent
                        .unwrap_or(self.service.config().breakeven_margin_percent);
                    self.service
                        .move_stop_loss_to_breakeven_with(position, margin)
                        .await;
                }
                TpHitAction::ActivateTrailing => {
                    if position.read(|p| p.stop_loss.is_trailing) {
                        debug!(position_id = %position.id(), "Trailing already active");
                        continue;
                    }
                    let base = level_config
                        .trailing_percent
                        .unwrap_or(self.service.config().trailing_stop_percent);
                    let distance = position.read(|p| {
                        calculate_trailing_distance(p, base, None, self.service.config().atr_multiplier)
                    });
                    self.service
                        .activate_trailing_stop(position, distance, price)
                        .await;
                }
                TpHitAction::ClosePosition => {
                    self.service
                        .close_full_position(
                            position,
                            price,
                            &format!("TP{level} configured close"),
                            ExitType::TakeProfit { level },
                        )
                        .await;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitConfig;
    use crate::exiting::ExitDeps;
    use crate::stub::{LogNotifier, MemoryJournal, MemorySessionStats, StubExchange};
    use futbot_core::{ManualClock, Position, Size};
    use rust_decimal_macros::dec;

    const STRATEGY: &str = r#"
        [[levels]]
        level = 1
        profit_percent = 2
        size_percent = 50
        on_hit = ["move_to_breakeven"]
        breakeven_margin_percent = 0.1

        [[levels]]
        level = 2
        profit_percent = 4
        size_percent = 30
        on_hit = ["activate_trailing"]
        trailing_percent = 0.5

        [[levels]]
        level = 3
        profit_percent = 6
        size_percent = 20
        on_hit = ["close_position"]
    "#;

    fn setup() -> (ExitEventHandler, Arc<StubExchange>, SharedPosition) {
        let strategy: ExitStrategyConfig = toml::from_str(STRATEGY).unwrap();
        let exchange = Arc::new(StubExchange::new());
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: Arc::new(MemoryJournal::new()),
                stats: Arc::new(MemorySessionStats::new()),
                notifier: Arc::new(LogNotifier),
                clock: Arc::new(ManualClock::new(0)),
            },
            ExitConfig::default(),
        ));
        let entry = Price::new(dec!(200));
        let position = SharedPosition::new(Position::open(
            "SOLUSDT",
            PositionSide::Short,
            entry,
            Size::new(dec!(10)),
            dec!(5),
            Price::new(dec!(210)),
            strategy.build_take_profits(entry, PositionSide::Short),
            0,
        ));
        (
            ExitEventHandler::new(service, Arc::new(strategy)),
            exchange,
            position,
        )
    }

    #[test]
    fn test_build_take_profits_short() {
        let strategy: ExitStrategyConfig = toml::from_str(STRATEGY).unwrap();
        let tps = strategy.build_take_profits(Price::new(dec!(200)), PositionSide::Short);
        assert_eq!(tps.len(), 3);
        assert_eq!(tps[0].price, Price::new(dec!(196)));
        assert_eq!(tps[2].price, Price::new(dec!(188)));
        assert_eq!(tps[1].size_percent, dec!(30));
    }

    #[tokio::test]
    async fn test_level_actions_follow_config() {
        let (handler, exchange, position) = setup();

        assert!(
            handler
                .handle(&position, ExitEvent::TakeProfitHit { level: 1, price: Price::new(dec!(196)) })
                .await
        );
        let sl = position.snapshot().stop_loss;
        assert!(sl.is_breakeven);
        assert_eq!(sl.price, Price::new(dec!(199.8)));

        assert!(
            handler
                .handle(&position, ExitEvent::TakeProfitHit { level: 2, price: Price::new(dec!(192)) })
                .await
        );
        let sl = position.snapshot().stop_loss;
        assert!(sl.is_trailing);
        // 0.5% of entry 200 = 1 above 192
        assert_eq!(sl.price, Price::new(dec!(193)));

        assert!(
            handler
                .handle(&position, ExitEvent::TakeProfitHit { level: 3, price: Price::new(dec!(188)) })
                .await
        );
        assert!(position.is_closed());
        assert_eq!(exchange.full_close_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_levels() {
        let (handler, _exchange, position) = setup();
        let event = ExitEvent::TakeProfitHit { level: 1, price: Price::new(dec!(196)) };
        assert!(handler.handle(&position, event.clone()).await);
        assert!(!handler.handle(&position, event).await);
        assert!(
            !handler
                .handle(&position, ExitEvent::TakeProfitHit { level: 7, price: Price::new(dec!(150)) })
                .await
        );
    }

    #[tokio::test]
    async fn test_position_closed_event() {
        let (handler, exchange, position) = setup();
        let event = ExitEvent::PositionClosed {
            price: Price::new(dec!(210)),
            exit_type: ExitType::StopLoss,
            reason: "stop".to_string(),
        };
        assert!(handler.handle(&position, event.clone()).await);
        assert!(!handler.handle(&position, event).await);
        assert_eq!(exchange.close_count(), 1);
    }
}
