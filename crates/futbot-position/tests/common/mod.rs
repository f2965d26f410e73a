//! Shared wiring for the exit-lifecycle integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use futbot_core::{Clock, ManualClock, Position, PositionSide, Price, SharedPosition, Size, TakeProfit};
use futbot_position::{
    ExitConfig, ExitDeps, MemoryJournal, MemorySessionStats, PositionEventHandler,
    PositionExitingService, PositionRepository, RecordingNotifier, StubExchange,
    TakeProfitLedger, TpLevelMatcher, TpMatcherConfig, WebSocketEventHandler,
};
use rust_decimal_macros::dec;

pub struct Lifecycle {
    pub exchange: Arc<StubExchange>,
    pub journal: Arc<MemoryJournal>,
    pub stats: Arc<MemorySessionStats>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub repository: Arc<PositionRepository>,
    pub service: Arc<PositionExitingService>,
    pub ws: WebSocketEventHandler,
    pub poll: PositionEventHandler,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::with_exchange(StubExchange::new())
    }

    pub fn with_exchange(exchange: StubExchange) -> Self {
        let exchange = Arc::new(exchange);
        let journal = Arc::new(MemoryJournal::new());
        let stats = Arc::new(MemorySessionStats::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let repository = Arc::new(PositionRepository::new(clock.clone()));
        let service = Arc::new(PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: journal.clone(),
                stats: stats.clone(),
                notifier: notifier.clone(),
                clock: clock.clone(),
            },
            ExitConfig::default(),
        ));
        let ws = WebSocketEventHandler::new(
            repository.clone(),
            service.clone(),
            TpLevelMatcher::new(TpMatcherConfig::default()),
        );
        let poll = PositionEventHandler::new(repository.clone(), service.clone());
        Self {
            exchange,
            journal,
            stats,
            notifier,
            clock,
            repository,
            service,
            ws,
            poll,
        }
    }

    /// LONG BTCUSDT entry 100, qty 10, SL 95, TP1 105 / TP2 110 / TP3 120.
    pub fn open_long(&self) -> SharedPosition {
        let journal_id = self.journal.open_trade();
        let position = Position::open(
            "BTCUSDT",
            PositionSide::Long,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
            dec!(10),
            Price::new(dec!(95)),
            vec![
                TakeProfit::new(1, dec!(5), dec!(33), Price::new(dec!(105))).with_order_id("tp-1"),
                TakeProfit::new(2, dec!(10), dec!(33), Price::new(dec!(110))).with_order_id("tp-2"),
                TakeProfit::new(3, dec!(20), dec!(34), Price::new(dec!(120))).with_order_id("tp-3"),
            ],
            self.clock.now_ms(),
        )
        .with_journal_id(journal_id);
        self.exchange.set_price("BTCUSDT", Price::new(dec!(100)));
        self.repository.open_position(position)
    }

    pub fn attach_ledger(&self, position: &SharedPosition) {
        let snapshot = position.snapshot();
        self.service.attach_ledger(Box::new(TakeProfitLedger::new(
            snapshot.side,
            snapshot.entry_price,
            snapshot.initial_quantity,
            self.service.config().fee_rate,
        )));
    }
}
