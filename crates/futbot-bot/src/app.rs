//! Main application orchestration.
//!
//! Paper mode wires the exit subsystem to in-memory collaborators:
//! - stub exchange standing in for the venue
//! - memory journal and session stats
//! - log notifier
//!
//! The stub exchange never pushes events itself, so the application plays
//! the venue's part: it fills stop-loss and TP orders when a replayed price
//! crosses them and reports a position-closed event after every full close.

use crate::config::{AppConfig, ExitMode};
use crate::error::{AppError, AppResult};
use crate::replay::{parse_line, ReplayLine};
use futbot_core::{parse_wire_decimal, Clock, ClockService, ManualClock, Price, SharedPosition};
use futbot_position::calc::{is_stop_loss_hit, is_tp_hit};
use futbot_position::{
    adopt_position, fill_missing_fields, CloseReason, ExitDeps, ExitEvent, ExitEventHandler,
    LadderTpManager, LadderTracker, LogNotifier, MemoryJournal, MemorySessionStats,
    OrderFillEvent, PositionEventHandler, PositionExitingService, PositionMonitor,
    PositionRepository, SessionSummary, StubExchange, TakeProfitLedger, TpLevelMatcher,
    WebSocketEventHandler, WsEvent,
};
use futbot_telemetry::Metrics;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a replay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub lines: usize,
    pub applied: usize,
    pub skipped: usize,
    pub session: SessionSummary,
    pub position_open: bool,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    // Set when replaying: `advance` lines move it.
    manual_clock: Option<Arc<ManualClock>>,
    exchange: Arc<StubExchange>,
    journal: Arc<MemoryJournal>,
    stats: Arc<MemorySessionStats>,
    repository: Arc<PositionRepository>,
    service: Arc<PositionExitingService>,
    ws_handler: WebSocketEventHandler,
    exit_handler: ExitEventHandler,
    monitor: Arc<PositionMonitor>,
    ladder: Option<LadderTracker>,
    seen_full_closes: usize,
}

impl Application {
    /// Application on the system clock.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        Self::build(config, Arc::new(ClockService::new()), None)
    }

    /// Application on a settable clock starting at `start_ms`, for replays.
    pub fn with_manual_clock(config: AppConfig, start_ms: u64) -> AppResult<Self> {
        let clock = Arc::new(ManualClock::new(start_ms));
        Self::build(config, clock.clone(), Some(clock))
    }

    fn build(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        manual_clock: Option<Arc<ManualClock>>,
    ) -> AppResult<Self> {
        let exchange = Arc::new(StubExchange::new().with_take_profit_amend());
        let journal = Arc::new(MemoryJournal::new());
        let stats = Arc::new(MemorySessionStats::new());

        let repository = Arc::new(PositionRepository::new(clock.clone()));
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: journal.clone(),
                stats: stats.clone(),
                notifier: Arc::new(LogNotifier),
                clock: clock.clone(),
            },
            config.exit.clone(),
        ));

        let ws_handler = WebSocketEventHandler::new(
            repository.clone(),
            service.clone(),
            TpLevelMatcher::new(config.matcher),
        );
        let exit_handler =
            ExitEventHandler::new(service.clone(), Arc::new(config.exit_strategy.clone()));
        let position_handler = Arc::new(PositionEventHandler::new(
            repository.clone(),
            service.clone(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            config.time_stop.clone(),
            repository.clone(),
            service.clone(),
            position_handler,
            clock.clone(),
        ));

        let ladder = if config.paper.exit_mode == ExitMode::Ladder {
            let manager = LadderTpManager::new(config.ladder.clone(), exchange.clone(), clock.clone())?;
            Some(LadderTracker::new(manager))
        } else {
            None
        };

        Ok(Self {
            config,
            clock,
            manual_clock,
            exchange,
            journal,
            stats,
            repository,
            service,
            ws_handler,
            exit_handler,
            monitor,
            ladder,
            seen_full_closes: 0,
        })
    }

    /// Validate the configured snapshot and start tracking it.
    pub fn open_paper_position(&mut self) -> AppResult<SharedPosition> {
        let mut snapshot = self.config.paper.position.clone();
        let entry = parse_wire_decimal(&snapshot.entry_price)
            .map(Price::new)
            .unwrap_or(Price::ZERO);
        fill_missing_fields(&mut snapshot, entry);

        let mut position = adopt_position(&snapshot, Vec::new(), self.clock.now_ms())?;
        if self.config.paper.exit_mode != ExitMode::Ladder {
            position.take_profits = self
                .config
                .exit_strategy
                .build_take_profits(position.entry_price, position.side)
                .into_iter()
                .map(|tp| {
                    let order_id = format!("paper-tp-{}", tp.level);
                    tp.with_order_id(order_id)
                })
                .collect();
            self.service.attach_ledger(Box::new(TakeProfitLedger::new(
                position.side,
                position.entry_price,
                position.initial_quantity,
                self.config.exit.fee_rate,
            )));
        }

        let journal_id = self.journal.open_trade();
        let position = position.with_journal_id(journal_id).with_reason("paper");
        self.exchange.set_price(&position.symbol, position.entry_price);

        info!(
            position_id = %position.id,
            side = %position.side,
            entry = %position.entry_price,
            quantity = %position.quantity,
            stop_loss = %position.stop_loss.price,
            take_profits = position.take_profits.len(),
            exit_mode = ?self.config.paper.exit_mode,
            "Paper position opened"
        );
        let shared = self.repository.open_position(position);
        if let Some(ladder) = self.ladder.as_mut() {
            ladder.start(shared.clone());
        }
        Ok(shared)
    }

    pub fn repository(&self) -> &Arc<PositionRepository> {
        &self.repository
    }

    pub fn journal(&self) -> &Arc<MemoryJournal> {
        &self.journal
    }

    pub fn exchange(&self) -> &Arc<StubExchange> {
        &self.exchange
    }

    pub fn session_summary(&self) -> SessionSummary {
        self.stats.summary()
    }

    pub async fn replay_file(&mut self, path: impl AsRef<Path>) -> AppResult<ReplaySummary> {
        let path = path.as_ref();
        info!(path = %path.display(), "Replaying events");
        let content = tokio::fs::read_to_string(path).await?;
        self.replay(&content).await
    }

    /// Feed every line through the bot. Lines with bad content are skipped;
    /// a line that is not JSON at all aborts the replay.
    pub async fn replay(&mut self, content: &str) -> AppResult<ReplaySummary> {
        let mut summary = ReplaySummary {
            lines: 0,
            applied: 0,
            skipped: 0,
            session: SessionSummary::default(),
            position_open: false,
        };

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let parsed = parse_line(raw).map_err(|message| AppError::Replay {
                line: line_no,
                message,
            })?;
            match parsed {
                Some(ReplayLine::Skip) => continue,
                Some(line) => {
                    summary.lines += 1;
                    self.apply(line).await;
                    summary.applied += 1;
                }
                None => {
                    summary.lines += 1;
                    summary.skipped += 1;
                    warn!(line = line_no, "Malformed replay event skipped");
                    Metrics::validation_rejected("replay");
                }
            }
            self.settle().await;
        }

        summary.session = self.stats.summary();
        summary.position_open = self.repository.has_position();
        Ok(summary)
    }

    async fn apply(&mut self, line: ReplayLine) {
        match line {
            ReplayLine::Price(price) => self.on_price(price).await,
            ReplayLine::Advance(ms) => {
                match &self.manual_clock {
                    Some(clock) => clock.advance(ms),
                    None => warn!(ms, "Clock advance ignored on the system clock"),
                }
                self.monitor.tick().await;
            }
            ReplayLine::Ws(event) => {
                self.ws_handler.handle(event).await;
            }
            ReplayLine::Skip => {}
        }
    }

    /// Paper venue reaction to a new price, then one monitor pass.
    async fn on_price(&mut self, price: Price) {
        let Some(position) = self.repository.get_current_position() else {
            debug!(%price, "Price tick with no position");
            return;
        };
        let snapshot = position.snapshot();
        self.exchange.set_price(&snapshot.symbol, price);

        if is_stop_loss_hit(&snapshot, price) {
            let fill = OrderFillEvent {
                order_id: "paper-sl".to_string(),
                symbol: Some(snapshot.symbol.clone()),
                avg_price: Some(Value::String(snapshot.stop_loss.price.to_string())),
                cum_exec_qty: Some(Value::String(snapshot.quantity.to_string())),
            };
            self.ws_handler.handle(WsEvent::StopLossFilled(fill)).await;
            self.exchange.set_price(&snapshot.symbol, snapshot.stop_loss.price);
            self.ws_handler.handle(WsEvent::PositionClosed).await;
            return;
        }

        match self.config.paper.exit_mode {
            ExitMode::Events => {
                for tp in snapshot.take_profits.iter().filter(|tp| !tp.hit) {
                    if !is_tp_hit(&snapshot, price, tp.price) {
                        continue;
                    }
                    let fill = OrderFillEvent {
                        order_id: tp.order_id.clone().unwrap_or_default(),
                        symbol: Some(snapshot.symbol.clone()),
                        avg_price: Some(Value::String(tp.price.to_string())),
                        cum_exec_qty: None,
                    };
                    self.ws_handler.handle(WsEvent::TakeProfitFilled(fill)).await;
                }
            }
            ExitMode::Strategy => {
                for tp in snapshot.take_profits.iter().filter(|tp| !tp.hit) {
                    if !is_tp_hit(&snapshot, price, tp.price) {
                        continue;
                    }
                    self.repository.set_last_close_reason(CloseReason::TakeProfit);
                    let event = ExitEvent::TakeProfitHit {
                        level: tp.level,
                        price: tp.price,
                    };
                    self.exit_handler.handle(&position, event).await;
                }
            }
            ExitMode::Ladder => {
                if let Some(ladder) = self.ladder.as_mut() {
                    let tick = ladder.on_price(price).await;
                    if !tick.levels_hit.is_empty() {
                        info!(levels = ?tick.levels_hit, "Ladder levels filled");
                    }
                }
            }
        }

        // the last TP order takes whatever was left
        if !position.is_closed() && position.read(|p| p.quantity.is_zero()) {
            self.ws_handler.handle(WsEvent::PositionClosed).await;
        }

        self.monitor.tick().await;
    }

    /// Report a position-closed event after any full close the bot sent.
    async fn settle(&mut self) {
        let full_closes = self.exchange.full_close_count();
        if full_closes > self.seen_full_closes {
            self.seen_full_closes = full_closes;
            if self.repository.has_position() {
                self.ws_handler.handle(WsEvent::PositionClosed).await;
            }
        }
    }

    /// Run the monitor loop until Ctrl-C.
    pub async fn run_until_shutdown(self) -> AppResult<()> {
        let shutdown = CancellationToken::new();
        let monitor = tokio::spawn(self.monitor.clone().run(shutdown.clone()));
        info!("Monitoring paper position, press Ctrl-C to stop");

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        shutdown.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }

        self.report(None)
    }

    /// Log the session and print the metrics exposition.
    pub fn report(&self, replay: Option<&ReplaySummary>) -> AppResult<()> {
        let session = self.stats.summary();
        if let Some(replay) = replay {
            info!(
                lines = replay.lines,
                applied = replay.applied,
                skipped = replay.skipped,
                position_open = replay.position_open,
                "Replay finished"
            );
        }
        info!(
            trades = session.trades,
            wins = session.wins,
            losses = session.losses,
            net_pnl = %session.net_pnl,
            "Session summary"
        );
        for record in self.journal.closes() {
            info!(
                position_id = %record.position_id,
                exit_type = %record.exit_type,
                exit_price = %record.exit_price,
                realized_pnl = %record.realized_pnl,
                tp_levels_hit = ?record.tp_levels_hit,
                "Closed trade"
            );
        }
        println!("{}", Metrics::render()?);
        Ok(())
    }
}
