//! Exit lifecycle for futbot futures positions.
//!
//! Everything that happens to a position after entry: stop-loss moves,
//! take-profit fills, partial and full closes, and recording the closed trade.
//!
//! # Key Components
//!
//! - [`PositionExitingService`]: Executes exit actions with idempotent full close
//! - [`ExitEventHandler`]: Config-driven reaction to TP hits and closes
//! - [`WebSocketEventHandler`]: Exchange push events (position, fills, errors)
//! - [`PositionEventHandler`]: Poll-path events (backup hits, time-based exit)
//! - [`PositionMonitor`]: Interval loop raising poll-path events
//! - [`TpLevelMatcher`]: Resolves a TP fill to its ladder level
//! - [`LadderTpManager`] / [`LadderTracker`]: Self-contained price-driven TP ladder
//! - [`TakeProfitLedger`]: Net PnL across partial fills
//! - [`PositionRepository`]: Tracked position and the per-position close lock
//! - [`calc`]: Pure exit calculations
//! - [`validator`]: Wire-boundary validation of position snapshots

pub mod calc;
pub mod config;
pub mod error;
pub mod exit_handler;
pub mod exiting;
pub mod ladder;
pub mod ledger;
pub mod monitor;
pub mod ports;
pub mod position_handler;
pub mod repository;
pub mod stub;
pub mod tp_matcher;
pub mod validator;
pub mod ws_handler;

pub use config::{ExitConfig, TpMatcherConfig};
pub use error::{
    ExchangeError, ExchangeResult, JournalError, LadderConfigError, NotifyError, PositionError,
    PositionResult, StatsError, ValidationError,
};
pub use exit_handler::{ExitEvent, ExitEventHandler, ExitStrategyConfig, TpHitAction, TpLevelConfig};
pub use exiting::{ExitDeps, PositionExitingService};
pub use ladder::{LadderLevelConfig, LadderTick, LadderTpConfig, LadderTpLevel, LadderTpManager, LadderTracker};
pub use ledger::{PartialFill, TakeProfitLedger};
pub use monitor::{detect_exit_events, MonitorConfig, PositionMonitor};
pub use ports::{
    ClosePositionRequest, ExchangeClient, FinalPnl, JournalTrade, Notifier, PartialCloseLedger,
    SessionStats, StopLossSummary, TakeProfitAmender, TradeCloseRecord, TradeExitStats,
    TradeJournal, TradeStatus, TrailingStopCapability, TrailingStopRequest, UpdateStopLossRequest,
};
pub use position_handler::{PositionEvent, PositionEventHandler};
pub use repository::{CloseReason, PositionRepository, SyncOutcome};
pub use stub::{
    LogNotifier, MemoryJournal, MemorySessionStats, RecordingNotifier, SessionSummary, StubCalls,
    StubExchange,
};
pub use tp_matcher::{MatchTier, TpFill, TpLevelMatcher, TpMatch};
pub use validator::{
    adopt_position, fill_missing_fields, validate_for_monitoring, validate_ws_update,
    PositionSnapshot, PositionUpdate,
};
pub use ws_handler::{OrderFillEvent, ValidatedFill, WebSocketEventHandler, WsEvent};
