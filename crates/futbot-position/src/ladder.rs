//! Ladder take-profit manager.
//!
//! A self-contained multi-level TP ladder for one position at a time, driven
//! by price ticks instead of exchange fill events. Each level closes a share
//! of the remaining quantity; the first hit moves the stop to entry and later
//! hits arm a trailing stop.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use futbot_core::{Clock, PositionSide, Price, SharedPosition, Size};
use futbot_telemetry::Metrics;

use crate::error::LadderConfigError;
use crate::ports::{ClosePositionRequest, ExchangeClient, UpdateStopLossRequest};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;
const MIN_CLOSE_PERCENT: Decimal = dec!(10);
const MAX_CLOSE_PERCENT: Decimal = dec!(90);

/// One configured rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderLevelConfig {
    /// Distance from entry in percent.
    pub price_percent: Decimal,
    /// Share of the remaining quantity to close, in percent.
    pub close_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderTpConfig {
    pub levels: Vec<LadderLevelConfig>,
    #[serde(default = "default_true")]
    pub breakeven_enabled: bool,
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,
    #[serde(default = "default_trailing_distance_percent")]
    pub trailing_distance_percent: Decimal,
    /// Relative undershoot still counted as a hit, in percent of target.
    #[serde(default = "default_hit_tolerance_percent")]
    pub hit_tolerance_percent: Decimal,
    /// Quantity step; close sizes are rounded down to it.
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Close sizes below this (after rounding) are skipped.
    #[serde(default = "default_lot_size")]
    pub min_close_qty: Decimal,
}

fn default_true() -> bool {
    true
}

fn default_trailing_distance_percent() -> Decimal {
    dec!(0.5)
}

fn default_hit_tolerance_percent() -> Decimal {
    dec!(0.001)
}

fn default_lot_size() -> Decimal {
    dec!(0.001)
}

impl Default for LadderTpConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LadderLevelConfig {
                    price_percent: dec!(0.5),
                    close_percent: dec!(40),
                },
                LadderLevelConfig {
                    price_percent: dec!(1.0),
                    close_percent: dec!(30),
                },
                LadderLevelConfig {
                    price_percent: dec!(1.5),
                    close_percent: dec!(50),
                },
            ],
            breakeven_enabled: true,
            trailing_enabled: true,
            trailing_distance_percent: default_trailing_distance_percent(),
            hit_tolerance_percent: default_hit_tolerance_percent(),
            lot_size: default_lot_size(),
            min_close_qty: default_lot_size(),
        }
    }
}

impl LadderTpConfig {
    pub fn validate(&self) -> Result<(), LadderConfigError> {
        if self.levels.is_empty() {
            return Err(LadderConfigError::NoLevels);
        }
        if self.levels.len() > usize::from(u8::MAX) {
            return Err(LadderConfigError::TooManyLevels(self.levels.len()));
        }
        for (i, level) in self.levels.iter().enumerate() {
            if level.price_percent <= Decimal::ZERO {
                return Err(LadderConfigError::InvalidPricePercent {
                    level: i + 1,
                    value: level.price_percent,
                });
            }
            if level.close_percent < MIN_CLOSE_PERCENT || level.close_percent > MAX_CLOSE_PERCENT {
                return Err(LadderConfigError::InvalidClosePercent {
                    level: i + 1,
                    value: level.close_percent,
                });
            }
        }
        if self.trailing_enabled && self.trailing_distance_percent <= Decimal::ZERO {
            return Err(LadderConfigError::InvalidTrailingDistance(
                self.trailing_distance_percent,
            ));
        }
        Ok(())
    }
}

/// A rung bound to a concrete entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderTpLevel {
    pub level: u8,
    pub price_percent: Decimal,
    pub close_percent: Decimal,
    pub target_price: Price,
    pub hit: bool,
}

pub struct LadderTpManager {
    config: LadderTpConfig,
    exchange: Arc<dyn ExchangeClient>,
    clock: Arc<dyn Clock>,
}

impl LadderTpManager {
    /// Fails on an invalid ladder.
    pub fn new(
        config: LadderTpConfig,
        exchange: Arc<dyn ExchangeClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LadderConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            exchange,
            clock,
        })
    }

    pub fn config(&self) -> &LadderTpConfig {
        &self.config
    }

    pub fn create_ladder_levels(&self, entry_price: Price, direction: PositionSide) -> Vec<LadderTpLevel> {
        self.config
            .levels
            .iter()
            .zip(1..=u8::MAX)
            .map(|(cfg, level)| {
                let offset = direction.sign() * cfg.price_percent / HUNDRED;
                LadderTpLevel {
                    level,
                    price_percent: cfg.price_percent,
                    close_percent: cfg.close_percent,
                    target_price: entry_price * (Decimal::ONE + offset),
                    hit: false,
                }
            })
            .collect()
    }

    /// Whether `current_price` reached the level, allowing a tiny undershoot.
    pub fn check_tp_hit(&self, level: &LadderTpLevel, current_price: Price, direction: PositionSide) -> bool {
        if level.hit {
            return false;
        }
        let tolerance = level.target_price.inner() * self.config.hit_tolerance_percent / HUNDRED;
        match direction {
            PositionSide::Long => current_price.inner() >= level.target_price.inner() - tolerance,
            PositionSide::Short => current_price.inner() <= level.target_price.inner() + tolerance,
        }
    }

    /// Close `level.close_percent` of the remaining quantity.
    ///
    /// The size is rounded down to the lot step, and the percentage sent to
    /// the exchange is the rounded size over the remaining quantity.
    pub async fn execute_partial_close(&self, level: &LadderTpLevel, position: &SharedPosition) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            debug!(position_id = %snapshot.id, level = level.level, "Ladder close on closed position ignored");
            return false;
        }

        let close_qty = snapshot
            .quantity
            .percent(level.close_percent)
            .round_to_lot(Size::new(self.config.lot_size));
        if close_qty.is_zero() || close_qty.inner() < self.config.min_close_qty {
            warn!(
                position_id = %snapshot.id,
                level = level.level,
                %close_qty,
                quantity = %snapshot.quantity,
                "Ladder close size too small, skipping"
            );
            Metrics::partial_close("ladder", "too_small");
            return false;
        }

        let request = ClosePositionRequest {
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            percentage: close_qty.inner() / snapshot.quantity.inner() * HUNDRED,
        };
        if let Err(e) = self.exchange.close_position(request).await {
            error!(position_id = %snapshot.id, level = level.level, error = %e, "Ladder partial close failed");
            Metrics::partial_close("ladder", "failed");
            return false;
        }

        let remaining = position.update(|p| {
            if p.is_closed() {
                return None;
            }
            p.quantity = p.quantity.saturating_sub(close_qty);
            Some(p.quantity)
        });
        let Some(remaining) = remaining else {
            debug!(position_id = %snapshot.id, level = level.level, "Position closed during ladder close");
            Metrics::partial_close("ladder", "closed");
            return false;
        };
        info!(
            position_id = %snapshot.id,
            level = level.level,
            target = %level.target_price,
            %close_qty,
            %remaining,
            "Ladder level closed"
        );
        Metrics::partial_close("ladder", "ok");
        true
    }

    /// Move the stop to entry.
    pub async fn move_to_breakeven(&self, position: &SharedPosition) -> bool {
        if !self.config.breakeven_enabled {
            return false;
        }
        let snapshot = position.snapshot();
        if snapshot.is_closed() || snapshot.stop_loss.is_breakeven {
            return false;
        }
        let entry = snapshot.entry_price;
        if !snapshot.side.is_more_favorable(entry, snapshot.stop_loss.price) {
            debug!(position_id = %snapshot.id, current = %snapshot.stop_loss.price, "Stop already past entry");
            return false;
        }
        if !self.push_stop_loss(&snapshot.id, &snapshot.symbol, snapshot.side, entry, "breakeven").await {
            return false;
        }

        let now_ms = self.clock.now_ms();
        let applied = position.update(|p| {
            if p.is_closed() || !p.side.is_more_favorable(entry, p.stop_loss.price) {
                return false;
            }
            p.stop_loss.price = entry;
            p.stop_loss.is_breakeven = true;
            p.stop_loss.updated_at = now_ms;
            true
        });
        if !applied {
            debug!(position_id = %snapshot.id, "Position changed during breakeven move");
            return false;
        }
        info!(position_id = %snapshot.id, %entry, "Ladder stop moved to breakeven");
        Metrics::sl_update("breakeven", "accepted");
        true
    }

    /// Trail the stop `trailing_distance_percent` behind `current_price`,
    /// only ever in the favorable direction.
    pub async fn move_trailing(&self, position: &SharedPosition, current_price: Price) -> bool {
        if !self.config.trailing_enabled {
            return false;
        }
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            return false;
        }
        let distance = current_price.inner() * self.config.trailing_distance_percent / HUNDRED;
        let candidate = Price::new(current_price.inner() - snapshot.side.sign() * distance);
        if !snapshot.side.is_more_favorable(candidate, snapshot.stop_loss.price) {
            Metrics::sl_update("trailing", "rejected");
            return false;
        }
        if !self.push_stop_loss(&snapshot.id, &snapshot.symbol, snapshot.side, candidate, "trailing").await {
            return false;
        }

        let now_ms = self.clock.now_ms();
        let applied = position.update(|p| {
            if p.is_closed() || !p.side.is_more_favorable(candidate, p.stop_loss.price) {
                return false;
            }
            p.stop_loss.price = candidate;
            p.stop_loss.is_trailing = true;
            p.stop_loss.trailing_percent = Some(self.config.trailing_distance_percent);
            p.stop_loss.updated_at = now_ms;
            true
        });
        if applied {
            debug!(position_id = %snapshot.id, new_sl = %candidate, "Ladder trailing stop moved");
            Metrics::sl_update("trailing", "accepted");
        }
        applied
    }

    async fn push_stop_loss(
        &self,
        position_id: &str,
        symbol: &str,
        side: PositionSide,
        price: Price,
        kind: &str,
    ) -> bool {
        let request = UpdateStopLossRequest {
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            side,
            new_price: price,
        };
        match self.exchange.update_stop_loss(request).await {
            Ok(()) => true,
            Err(e) => {
                error!(position_id, kind, %price, error = %e, "Ladder stop-loss update failed");
                Metrics::sl_update(kind, "failed");
                false
            }
        }
    }
}

/// What one price tick did to the active ladder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LadderTick {
    pub levels_hit: Vec<u8>,
    pub breakeven_moved: bool,
    pub trailing_moved: bool,
    pub finished: bool,
}

struct ActiveLadder {
    position: SharedPosition,
    direction: PositionSide,
    levels: Vec<LadderTpLevel>,
}

impl ActiveLadder {
    fn hit_count(&self) -> usize {
        self.levels.iter().filter(|l| l.hit).count()
    }
}

/// Holds at most one active ladder.
pub struct LadderTracker {
    manager: LadderTpManager,
    active: Option<ActiveLadder>,
}

impl LadderTracker {
    pub fn new(manager: LadderTpManager) -> Self {
        Self {
            manager,
            active: None,
        }
    }

    /// Start a ladder for `position`, discarding any previous one.
    pub fn start(&mut self, position: SharedPosition) -> &[LadderTpLevel] {
        let snapshot = position.snapshot();
        if let Some(previous) = self.active.take() {
            warn!(
                previous = %previous.position.id(),
                next = %snapshot.id,
                "Replacing active ladder"
            );
        }
        let levels = self
            .manager
            .create_ladder_levels(snapshot.entry_price, snapshot.side);
        info!(position_id = %snapshot.id, levels = levels.len(), "Ladder started");
        let active = self.active.insert(ActiveLadder {
            position,
            direction: snapshot.side,
            levels,
        });
        &active.levels
    }

    pub fn levels(&self) -> Option<&[LadderTpLevel]> {
        self.active.as_ref().map(|a| a.levels.as_slice())
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Drive the ladder with the latest price.
    pub async fn on_price(&mut self, current_price: Price) -> LadderTick {
        let mut tick = LadderTick::default();
        let Some(active) = self.active.as_mut() else {
            return tick;
        };
        if active.position.is_closed() {
            debug!(position_id = %active.position.id(), "Ladder position closed, dropping ladder");
            self.active = None;
            tick.finished = true;
            return tick;
        }

        let hits_before = active.hit_count();
        for i in 0..active.levels.len() {
            if !self
                .manager
                .check_tp_hit(&active.levels[i], current_price, active.direction)
            {
                continue;
            }
            if !self
                .manager
                .execute_partial_close(&active.levels[i], &active.position)
                .await
            {
                // retried on the next tick
                break;
            }
            active.levels[i].hit = true;
            tick.levels_hit.push(active.levels[i].level);
        }

        let hits = active.hit_count();
        if hits_before == 0 && hits > 0 {
            tick.breakeven_moved = self.manager.move_to_breakeven(&active.position).await;
        }
        if hits >= 2 {
            tick.trailing_moved = self
                .manager
                .move_trailing(&active.position, current_price)
                .await;
        }
        tick.finished = hits == active.levels.len();
        tick
    }
}
