//! Position repository: the tracked position and its per-key close lock.
//!
//! The bot trades one position at a time. Every exit path reads the same
//! [`SharedPosition`] from here, and every close that can race another close
//! runs inside [`PositionRepository::close_position_with_atomic_lock`].

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use futbot_core::{Clock, Position, SharedPosition};
use futbot_telemetry::Metrics;

use crate::validator::PositionUpdate;

/// Lock key used when no position is tracked.
const NO_POSITION_KEY: &str = "__none__";

/// What actually triggered the most recent close on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TakeProfit,
    Trailing,
    StopLoss,
    TimeBased,
}

/// Outcome of a WebSocket sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// Entry price was zero and has now been filled in.
    EntryFilled,
    NoPosition,
    IdMismatch,
    Closed,
}

pub struct PositionRepository {
    current: RwLock<Option<SharedPosition>>,
    close_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    last_close_reason: RwLock<Option<CloseReason>>,
    clock: Arc<dyn Clock>,
}

impl PositionRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            current: RwLock::new(None),
            close_locks: DashMap::new(),
            last_close_reason: RwLock::new(None),
            clock,
        }
    }

    /// Start tracking `position`, replacing anything tracked before.
    pub fn open_position(&self, position: Position) -> SharedPosition {
        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price = %position.entry_price,
            quantity = %position.quantity,
            "Position opened"
        );
        let shared = SharedPosition::new(position);
        if let Some(previous) = self.current.write().replace(shared.clone()) {
            warn!(position_id = %previous.id(), "Replacing previously tracked position");
        }
        *self.last_close_reason.write() = None;
        Metrics::position_opened();
        shared
    }

    pub fn get_current_position(&self) -> Option<SharedPosition> {
        self.current.read().clone()
    }

    pub fn has_position(&self) -> bool {
        self.current.read().is_some()
    }

    /// Apply a validated WebSocket frame to the tracked position.
    ///
    /// Quantity and PnL follow the exchange. The entry price is only filled
    /// in while it is still zero and is never overwritten afterwards.
    pub fn sync_with_websocket(&self, update: &PositionUpdate) -> SyncOutcome {
        let Some(shared) = self.get_current_position() else {
            debug!(position_id = %update.id, "No tracked position, WS sync ignored");
            return SyncOutcome::NoPosition;
        };

        shared.update(|p| {
            if p.id != update.id {
                debug!(tracked = %p.id, incoming = %update.id, "WS sync for another position ignored");
                return SyncOutcome::IdMismatch;
            }
            if p.is_closed() {
                return SyncOutcome::Closed;
            }

            p.quantity = update.quantity;
            p.unrealized_pnl = update.unrealized_pnl;
            if let Some(leverage) = update.leverage.filter(|l| !l.is_zero()) {
                p.leverage = leverage;
            }

            if p.entry_price.is_zero() && update.entry_price.is_positive() {
                p.entry_price = update.entry_price;
                p.margin_used = p.quantity.notional(p.entry_price) / p.leverage.max(Decimal::ONE);
                info!(position_id = %p.id, entry_price = %p.entry_price, "Entry price filled from WS");
                SyncOutcome::EntryFilled
            } else {
                SyncOutcome::Synced
            }
        })
    }

    /// Stop tracking the current position.
    pub fn clear_position(&self) -> Option<SharedPosition> {
        let cleared = self.current.write().take();
        if let Some(shared) = &cleared {
            info!(position_id = %shared.id(), "Tracked position cleared");
            Metrics::position_cleared();
        }
        cleared
    }

    pub fn set_last_close_reason(&self, reason: CloseReason) {
        *self.last_close_reason.write() = Some(reason);
    }

    pub fn last_close_reason(&self) -> Option<CloseReason> {
        *self.last_close_reason.read()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Run `f` while holding the close lock of the tracked position.
    ///
    /// The lock is keyed by position id with a single in-flight holder per
    /// key. The tracked position is re-read after the lock is acquired, so
    /// `f` never sees state from before a competing holder finished.
    pub async fn close_position_with_atomic_lock<F, Fut, R>(&self, reason: &str, f: F) -> R
    where
        F: FnOnce(Option<SharedPosition>) -> Fut,
        Fut: Future<Output = R>,
    {
        let key = self
            .get_current_position()
            .map(|p| p.id())
            .unwrap_or_else(|| NO_POSITION_KEY.to_string());
        let lock = self
            .close_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;
        debug!(key = %key, reason, "Close lock acquired");

        let current = self.get_current_position();
        let result = f(current).await;

        debug!(key = %key, reason, "Close lock released");
        result
    }
}
