//! Position aggregate: one open futures trade and its protective orders.
//!
//! The [`Position`] is the single mutable record shared by every exit path
//! (WebSocket events, poll-based monitor, ladder manager). Cross-task access
//! goes through [`SharedPosition`], whose lock is only ever held for
//! synchronous sections, never across an exchange call.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::{Price, Size};

// ============================================================================
// Side / Status
// ============================================================================

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Returns 1 for long, -1 for short (for PnL calculations).
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Whether `candidate` is strictly better than `current` for this side.
    ///
    /// Long: higher is better. Short: lower is better. Used for every
    /// stop-loss ratchet and take-profit extension check.
    pub fn is_more_favorable(&self, candidate: Price, current: Price) -> bool {
        match self {
            Self::Long => candidate > current,
            Self::Short => candidate < current,
        }
    }

    /// Parse from the exchange's side vocabulary.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(Self::Long),
            "SHORT" | "SELL" => Some(Self::Short),
            _ => None,
        }
    }
}

impl FromStr for PositionSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidSide(s.to_string()))
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle status. `Open -> Closed` is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    #[default]
    Open,
    Closed,
}

// ============================================================================
// StopLoss / TakeProfit
// ============================================================================

/// Protective stop-loss state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLoss {
    /// Current stop price.
    pub price: Price,
    /// Stop price at position open.
    pub initial_price: Price,
    /// Exchange order id of the conditional stop order.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Stop has been moved to (or beyond) breakeven.
    #[serde(default)]
    pub is_breakeven: bool,
    /// Stop is trailing the market.
    #[serde(default)]
    pub is_trailing: bool,
    #[serde(default)]
    pub trailing_percent: Option<Decimal>,
    #[serde(default)]
    pub trailing_activation_price: Option<Price>,
    /// Last modification (Unix ms).
    pub updated_at: u64,
}

impl StopLoss {
    /// Create the initial stop for a freshly opened position.
    #[must_use]
    pub fn new(price: Price, now_ms: u64) -> Self {
        Self {
            price,
            initial_price: price,
            order_id: None,
            is_breakeven: false,
            is_trailing: false,
            trailing_percent: None,
            trailing_activation_price: None,
            updated_at: now_ms,
        }
    }
}

/// One configured take-profit level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeProfit {
    /// 1-based level number.
    pub level: u8,
    /// Distance from entry in percent.
    pub percent: Decimal,
    /// Fraction of the ORIGINAL quantity closed at this level, in percent.
    pub size_percent: Decimal,
    /// Target price.
    pub price: Price,
    #[serde(default)]
    pub hit: bool,
    #[serde(default)]
    pub hit_at: Option<u64>,
    /// Exchange order id; cleared once the level is hit.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl TakeProfit {
    #[must_use]
    pub fn new(level: u8, percent: Decimal, size_percent: Decimal, price: Price) -> Self {
        Self {
            level,
            percent,
            size_percent,
            price,
            hit: false,
            hit_at: None,
            order_id: None,
        }
    }

    #[must_use]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Mark the level hit. Returns `false` if it was already hit.
    pub fn mark_hit(&mut self, now_ms: u64) -> bool {
        if self.hit {
            return false;
        }
        self.hit = true;
        self.hit_at = Some(now_ms);
        self.order_id = None;
        true
    }
}

// ============================================================================
// Position
// ============================================================================

/// An open (or just-closed) futures position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Stable id derived from symbol + side.
    pub id: String,
    pub symbol: String,
    pub side: PositionSide,
    /// Fixed at open. Only a WebSocket sync may fill it, and only while zero.
    pub entry_price: Price,
    /// Live quantity, decreases on partial close.
    pub quantity: Size,
    /// Quantity at open; `TakeProfit::size_percent` is relative to this.
    pub initial_quantity: Size,
    pub leverage: Decimal,
    pub margin_used: Decimal,
    pub stop_loss: StopLoss,
    pub take_profits: Vec<TakeProfit>,
    pub status: PositionStatus,
    pub unrealized_pnl: Decimal,
    /// Unix ms.
    pub opened_at: u64,
    /// Entry order id.
    pub order_id: String,
    /// Free-text provenance of the entry.
    pub reason: String,
    /// Linked journal record. `None` for positions restored from exchange state.
    #[serde(default)]
    pub journal_id: Option<String>,
}

impl Position {
    /// Derive the position id for a symbol/side pair.
    #[must_use]
    pub fn derive_id(symbol: &str, side: PositionSide) -> String {
        format!("{symbol}_{side}")
    }

    /// Create a new open position.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: Price,
        quantity: Size,
        leverage: Decimal,
        stop_loss: Price,
        take_profits: Vec<TakeProfit>,
        opened_at: u64,
    ) -> Self {
        let symbol = symbol.into();
        let margin_used = if leverage.is_zero() {
            quantity.notional(entry_price)
        } else {
            quantity.notional(entry_price) / leverage
        };
        Self {
            id: Self::derive_id(&symbol, side),
            symbol,
            side,
            entry_price,
            quantity,
            initial_quantity: quantity,
            leverage,
            margin_used,
            stop_loss: StopLoss::new(stop_loss, opened_at),
            take_profits,
            status: PositionStatus::Open,
            unrealized_pnl: Decimal::ZERO,
            opened_at,
            order_id: String::new(),
            reason: String::new(),
            journal_id: None,
        }
    }

    #[must_use]
    pub fn with_journal_id(mut self, journal_id: impl Into<String>) -> Self {
        self.journal_id = Some(journal_id.into());
        self
    }

    #[must_use]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = order_id.into();
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    #[must_use]
    pub fn take_profit(&self, level: u8) -> Option<&TakeProfit> {
        self.take_profits.iter().find(|tp| tp.level == level)
    }

    pub fn take_profit_mut(&mut self, level: u8) -> Option<&mut TakeProfit> {
        self.take_profits.iter_mut().find(|tp| tp.level == level)
    }

    /// Levels already hit, ascending.
    #[must_use]
    pub fn hit_levels(&self) -> Vec<u8> {
        let mut levels: Vec<u8> = self
            .take_profits
            .iter()
            .filter(|tp| tp.hit)
            .map(|tp| tp.level)
            .collect();
        levels.sort_unstable();
        levels
    }

    /// Holding time at `now_ms` (saturating on clock skew).
    #[must_use]
    pub fn holding_time_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.opened_at)
    }
}

// ============================================================================
// SharedPosition
// ============================================================================

/// Shared handle to a tracked position.
///
/// Every exit path holds a clone of the same handle. All accessors take the
/// lock for a synchronous closure only, so check-and-set sequences such as
/// "claim the close" are atomic and no guard ever lives across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedPosition(Arc<Mutex<Position>>);

impl SharedPosition {
    #[must_use]
    pub fn new(position: Position) -> Self {
        Self(Arc::new(Mutex::new(position)))
    }

    /// Clone of the current state.
    #[must_use]
    pub fn snapshot(&self) -> Position {
        self.0.lock().clone()
    }

    /// Read through the lock.
    pub fn read<R>(&self, f: impl FnOnce(&Position) -> R) -> R {
        f(&self.0.lock())
    }

    /// Mutate through the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Position) -> R) -> R {
        f(&mut self.0.lock())
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.read(|p| p.id.clone())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.read(Position::is_closed)
    }

    /// Atomically transition `Open -> Closed`.
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub fn try_mark_closed(&self) -> bool {
        self.update(|p| {
            if p.is_closed() {
                false
            } else {
                p.status = PositionStatus::Closed;
                true
            }
        })
    }

    /// Undo a claimed close after the exchange rejected it.
    pub fn reopen(&self) {
        self.update(|p| p.status = PositionStatus::Open);
    }

    /// Whether two handles point at the same position.
    #[must_use]
    pub fn same_as(&self, other: &SharedPosition) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
