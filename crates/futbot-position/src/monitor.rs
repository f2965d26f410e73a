//! Polling position monitor.
//!
//! Runs on a fixed interval against the tracked position:
//! - refreshes the trailing stop and the TP3 extension from the latest price
//! - raises backup SL/TP crossing events (once per level)
//! - raises the time-based exit once the holding time is exceeded
//!
//! Detection is a pure function of the snapshot, the price and the clock so
//! it can be tested without the loop.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use futbot_core::{Clock, Position, Price, SharedPosition};

use crate::calc::{is_stop_loss_hit, is_tp_hit};
use crate::exiting::PositionExitingService;
use crate::position_handler::{PositionEvent, PositionEventHandler};
use crate::repository::PositionRepository;

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often to check the position (ms).
    /// Default: 1000ms.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Maximum holding time before a time-based exit (ms). 0 disables.
    /// Default: 4 hours.
    #[serde(default = "default_max_holding_ms")]
    pub max_holding_ms: u64,
    /// Refresh the trailing stop on every tick once trailing is active.
    #[serde(default = "default_enabled")]
    pub smart_trailing_enabled: bool,
    /// Push the TP3 order out while price runs toward it.
    #[serde(default)]
    pub smart_tp3_enabled: bool,
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_max_holding_ms() -> u64 {
    4 * 60 * 60 * 1000
}

fn default_enabled() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            max_holding_ms: default_max_holding_ms(),
            smart_trailing_enabled: default_enabled(),
            smart_tp3_enabled: false,
        }
    }
}

/// Backup and time-based exit events for one tick.
pub fn detect_exit_events(
    position: &Position,
    price: Price,
    now_ms: u64,
    max_holding_ms: u64,
) -> Vec<PositionEvent> {
    let mut events = Vec::new();
    if position.is_closed() {
        return events;
    }

    if is_stop_loss_hit(position, price) {
        events.push(PositionEvent::StopLossHit {
            position_id: position.id.clone(),
            price,
        });
    }

    for tp in position.take_profits.iter().filter(|tp| !tp.hit) {
        if is_tp_hit(position, price, tp.price) {
            events.push(PositionEvent::TakeProfitHit {
                position_id: position.id.clone(),
                level: tp.level,
                price,
            });
        }
    }

    let holding_time_ms = position.holding_time_ms(now_ms);
    if max_holding_ms > 0 && holding_time_ms >= max_holding_ms {
        events.push(PositionEvent::TimeBasedExit {
            position_id: position.id.clone(),
            price,
            holding_time_ms,
        });
    }

    events
}

fn event_key(event: &PositionEvent) -> String {
    match event {
        PositionEvent::StopLossHit { position_id, .. } => format!("{position_id}:sl"),
        PositionEvent::TakeProfitHit {
            position_id, level, ..
        } => format!("{position_id}:tp{level}"),
        PositionEvent::TimeBasedExit { position_id, .. } => format!("{position_id}:time"),
        PositionEvent::ClosedExternally { position_id, .. } => format!("{position_id}:external"),
    }
}

/// Dispatched event keys, scoped to the position they were raised for.
///
/// Ids repeat across positions on the same symbol and side, so the keys are
/// dropped whenever a different position becomes tracked.
#[derive(Default)]
struct FiredEvents {
    owner: Option<SharedPosition>,
    keys: HashSet<String>,
}

impl FiredEvents {
    fn track(&mut self, position: &SharedPosition) {
        if self.owner.as_ref().is_some_and(|o| o.same_as(position)) {
            return;
        }
        if !self.keys.is_empty() {
            debug!(position_id = %position.id(), "New position tracked, resetting fired events");
        }
        self.keys.clear();
        self.owner = Some(position.clone());
    }
}

pub struct PositionMonitor {
    config: MonitorConfig,
    repository: Arc<PositionRepository>,
    service: Arc<PositionExitingService>,
    handler: Arc<PositionEventHandler>,
    clock: Arc<dyn Clock>,
    /// Events already dispatched, so each crossing is raised once.
    fired: Mutex<FiredEvents>,
}

impl PositionMonitor {
    #[must_use]
    pub fn new(
        config: MonitorConfig,
        repository: Arc<PositionRepository>,
        service: Arc<PositionExitingService>,
        handler: Arc<PositionEventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            repository,
            service,
            handler,
            clock,
            fired: Mutex::new(FiredEvents::default()),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            check_interval_ms = self.config.check_interval_ms,
            max_holding_ms = self.config.max_holding_ms,
            "PositionMonitor started"
        );

        let interval = tokio::time::Duration::from_millis(self.config.check_interval_ms);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("PositionMonitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One monitoring pass. Returns the number of events dispatched.
    pub async fn tick(&self) -> usize {
        let Some(position) = self.repository.get_current_position() else {
            return 0;
        };
        self.fired.lock().track(&position);
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            return 0;
        }

        let price = match self
            .service
            .exchange()
            .get_current_price(&snapshot.symbol)
            .await
        {
            Ok(price) if price.is_positive() => price,
            Ok(_) | Err(_) => {
                warn!(symbol = %snapshot.symbol, "No price available, skipping monitor tick");
                return 0;
            }
        };

        if self.config.smart_trailing_enabled && snapshot.stop_loss.is_trailing {
            self.service
                .update_smart_trailing_v2(&position, price, None)
                .await;
        }
        if self.config.smart_tp3_enabled {
            self.service.update_smart_tp3(&position, price).await;
        }

        let snapshot = position.snapshot();
        let events = detect_exit_events(
            &snapshot,
            price,
            self.clock.now_ms(),
            self.config.max_holding_ms,
        );

        let mut dispatched = 0;
        for event in events {
            let key = event_key(&event);
            if self.fired.lock().keys.contains(&key) {
                continue;
            }
            debug!(key = %key, "Dispatching monitor event");
            let is_time_exit = matches!(event, PositionEvent::TimeBasedExit { .. });
            let acted = self.handler.handle(event).await;
            // a failed time-based exit is retried on the next tick
            if !is_time_exit || acted {
                self.fired.lock().keys.insert(key);
            }
            dispatched += 1;
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitConfig;
    use crate::exiting::ExitDeps;
    use crate::stub::{MemoryJournal, MemorySessionStats, RecordingNotifier, StubExchange};
    use futbot_core::{ManualClock, PositionSide, SharedPosition, Size, TakeProfit};
    use rust_decimal_macros::dec;

    fn position(opened_at: u64) -> Position {
        Position::open(
            "BTCUSDT",
            PositionSide::Long,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
            dec!(10),
            Price::new(dec!(95)),
            vec![
                TakeProfit::new(1, dec!(5), dec!(33), Price::new(dec!(105))),
                TakeProfit::new(2, dec!(10), dec!(33), Price::new(dec!(110))),
            ],
            opened_at,
        )
    }

    #[test]
    fn test_detect_nothing_in_range() {
        let pos = position(0);
        assert!(detect_exit_events(&pos, Price::new(dec!(101)), 1_000, 60_000).is_empty());
    }

    #[test]
    fn test_detect_tp_levels_and_time() {
        let pos = position(0);
        let events = detect_exit_events(&pos, Price::new(dec!(111)), 60_000, 60_000);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], PositionEvent::TakeProfitHit { level: 1, .. }));
        assert!(matches!(events[1], PositionEvent::TakeProfitHit { level: 2, .. }));
        assert!(matches!(
            events[2],
            PositionEvent::TimeBasedExit {
                holding_time_ms: 60_000,
                ..
            }
        ));
    }

    #[test]
    fn test_detect_skips_hit_levels_and_disabled_time_stop() {
        let mut pos = position(0);
        pos.take_profits[0].mark_hit(1);
        let events = detect_exit_events(&pos, Price::new(dec!(94)), u64::MAX / 2, 0);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PositionEvent::StopLossHit { .. }));
    }

    struct Harness {
        monitor: PositionMonitor,
        repository: Arc<PositionRepository>,
        exchange: Arc<StubExchange>,
        clock: Arc<ManualClock>,
    }

    fn harness(config: MonitorConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let exchange = Arc::new(StubExchange::new());
        let repository = Arc::new(PositionRepository::new(clock.clone()));
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: Arc::new(MemoryJournal::new()),
                stats: Arc::new(MemorySessionStats::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                clock: clock.clone(),
            },
            ExitConfig::default(),
        ));
        let handler = Arc::new(PositionEventHandler::new(repository.clone(), service.clone()));
        Harness {
            monitor: PositionMonitor::new(config, repository.clone(), service, handler, clock.clone()),
            repository,
            exchange,
            clock,
        }
    }

    #[tokio::test]
    async fn test_tick_without_position_or_price() {
        let h = harness(MonitorConfig::default());
        assert_eq!(h.monitor.tick().await, 0);
        h.repository.open_position(position(0));
        assert_eq!(h.monitor.tick().await, 0);
    }

    #[tokio::test]
    async fn test_backup_events_fire_once() {
        let h = harness(MonitorConfig::default());
        h.repository.open_position(position(0));
        h.exchange.set_price("BTCUSDT", Price::new(dec!(106)));
        assert_eq!(h.monitor.tick().await, 1);
        assert_eq!(h.monitor.tick().await, 0);
        assert_eq!(h.exchange.close_count(), 0);
    }

    #[tokio::test]
    async fn test_time_exit_retried_until_it_acts() {
        let h = harness(MonitorConfig {
            max_holding_ms: 1_000,
            ..MonitorConfig::default()
        });
        let pos: SharedPosition = h.repository.open_position(position(0));
        h.exchange.set_price("BTCUSDT", Price::new(dec!(101)));
        h.clock.set(2_000);

        h.exchange.set_fail_closes(true);
        assert_eq!(h.monitor.tick().await, 1);
        assert!(h.repository.has_position());

        h.exchange.set_fail_closes(false);
        assert_eq!(h.monitor.tick().await, 1);
        assert_eq!(h.monitor.tick().await, 0);
        assert!(!pos.is_closed());
    }

    #[tokio::test]
    async fn test_events_fire_again_for_next_position_with_same_id() {
        let h = harness(MonitorConfig {
            max_holding_ms: 1_000,
            ..MonitorConfig::default()
        });
        let first = h.repository.open_position(position(0));
        h.exchange.set_price("BTCUSDT", Price::new(dec!(101)));
        h.clock.set(2_000);
        assert_eq!(h.monitor.tick().await, 1);
        assert_eq!(h.monitor.tick().await, 0);
        assert_eq!(h.exchange.close_count(), 1);

        h.repository.clear_position();
        let second = h.repository.open_position(position(5_000));
        assert_eq!(first.id(), second.id());
        h.clock.set(10_000);

        assert_eq!(h.monitor.tick().await, 1);
        assert_eq!(h.exchange.close_count(), 2);
    }

    #[tokio::test]
    async fn test_trailing_refresh_ratchets() {
        let h = harness(MonitorConfig::default());
        let pos = h.repository.open_position(position(0));
        pos.update(|p| {
            p.stop_loss.is_trailing = true;
            p.stop_loss.trailing_percent = Some(dec!(1));
        });
        h.exchange.set_price("BTCUSDT", Price::new(dec!(104)));
        h.monitor.tick().await;
        let sl = pos.snapshot().stop_loss.price;
        assert_eq!(sl, Price::new(dec!(103)));

        h.exchange.set_price("BTCUSDT", Price::new(dec!(102)));
        h.monitor.tick().await;
        assert_eq!(pos.snapshot().stop_loss.price, sl);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(MonitorConfig {
            check_interval_ms: 10,
            ..MonitorConfig::default()
        });
        let monitor = Arc::new(h.monitor);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));
        shutdown.cancel();
        assert!(task.await.is_ok());
    }
}
