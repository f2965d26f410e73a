//! Position exiting service.
//!
//! Executes exit actions against the exchange and keeps the local
//! [`Position`] consistent with what the exchange did:
//!
//! - exactly-once full close: `status` flips to `Closed` under the position
//!   lock before the first exchange call, so concurrent callers have a
//!   single winner
//! - stop-loss ratchet: breakeven, trailing and manual updates only ever
//!   move the stop in the favorable direction
//! - partial closes mutate quantity only after the exchange accepted them
//! - recording (journal, session stats, notification) never turns a
//!   successful exchange close into a failure

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use futbot_core::{Clock, ExitAction, ExitType, Position, Price, SharedPosition, Size};
use futbot_telemetry::Metrics;

use crate::calc::{
    calculate_breakeven_sl, calculate_current_trailing_sl, calculate_pnl_percent,
    calculate_trailing_distance, expected_quantity_after_hits, is_breakeven_valid, pnl_for,
    round_trip_fees,
};
use crate::config::ExitConfig;
use crate::ports::{
    ClosePositionRequest, ExchangeClient, FinalPnl, Notifier, PartialCloseLedger, SessionStats,
    StopLossSummary, TradeCloseRecord, TradeExitStats, TradeJournal, TrailingStopRequest,
    UpdateStopLossRequest,
};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Collaborators of the exiting service.
#[derive(Clone)]
pub struct ExitDeps {
    pub exchange: Arc<dyn ExchangeClient>,
    pub journal: Arc<dyn TradeJournal>,
    pub stats: Arc<dyn SessionStats>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

pub struct PositionExitingService {
    deps: ExitDeps,
    config: ExitConfig,
    ledger: Mutex<Option<Box<dyn PartialCloseLedger>>>,
}

impl PositionExitingService {
    pub fn new(deps: ExitDeps, config: ExitConfig) -> Self {
        Self {
            deps,
            config,
            ledger: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeClient> {
        &self.deps.exchange
    }

    pub fn journal(&self) -> &Arc<dyn TradeJournal> {
        &self.deps.journal
    }

    pub fn now_ms(&self) -> u64 {
        self.deps.clock.now_ms()
    }

    /// Attach the partial-close ledger for the current position.
    pub fn attach_ledger(&self, ledger: Box<dyn PartialCloseLedger>) {
        *self.ledger.lock() = Some(ledger);
    }

    pub fn detach_ledger(&self) -> Option<Box<dyn PartialCloseLedger>> {
        self.ledger.lock().take()
    }

    pub fn has_ledger(&self) -> bool {
        self.ledger.lock().is_some()
    }

    /// Send a best-effort notification; failures are logged only.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.deps.notifier.send_alert(text).await {
            warn!(error = %e, "Notification failed");
        }
    }

    // ========================================================================
    // Dispatcher
    // ========================================================================

    /// Execute `action` on `position`.
    ///
    /// An already-closed position is a silent no-op: nothing reaches the
    /// exchange and `false` is returned.
    pub async fn execute_exit_action(
        &self,
        position: &SharedPosition,
        action: &ExitAction,
        exit_price: Price,
        exit_reason: &str,
        exit_type: ExitType,
    ) -> bool {
        let label = action.label();
        if position.is_closed() {
            debug!(
                position_id = %position.id(),
                action = label,
                "Exit action on closed position ignored"
            );
            Metrics::duplicate_close("exit_action");
            Metrics::exit_action(label, "skipped");
            return false;
        }

        let ok = match action {
            ExitAction::ClosePercent { percent } => {
                self.close_partial_position(position, *percent, exit_price, exit_reason, exit_type)
                    .await
            }
            ExitAction::CloseAll => {
                self.close_full_position(position, exit_price, exit_reason, exit_type)
                    .await
            }
            ExitAction::UpdateSl { new_stop_loss } => {
                self.update_stop_loss(position, *new_stop_loss).await
            }
            ExitAction::ActivateTrailing { trailing_percent } => {
                let distance = position.read(|p| {
                    calculate_trailing_distance(p, *trailing_percent, None, self.config.atr_multiplier)
                });
                self.activate_trailing_stop(position, distance, exit_price)
                    .await
            }
            ExitAction::MoveSlToBreakeven => self.move_stop_loss_to_breakeven(position).await,
        };

        Metrics::exit_action(label, if ok { "ok" } else { "failed" });
        ok
    }

    // ========================================================================
    // Partial close
    // ========================================================================

    /// Close `percent`% of the live quantity.
    ///
    /// Quantity is reduced only after the exchange accepted the close. When
    /// a ledger is attached the fill is booked against the TP level whose
    /// price is within the partial-close tolerance of `exit_price`.
    pub async fn close_partial_position(
        &self,
        position: &SharedPosition,
        percent: Decimal,
        exit_price: Price,
        exit_reason: &str,
        exit_type: ExitType,
    ) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            debug!(position_id = %snapshot.id, "Partial close on closed position ignored");
            Metrics::duplicate_close("close_partial");
            return false;
        }
        if percent <= Decimal::ZERO || percent > HUNDRED {
            warn!(position_id = %snapshot.id, %percent, "Partial close percent out of range");
            return false;
        }
        if percent == HUNDRED {
            return self
                .close_full_position(position, exit_price, exit_reason, exit_type)
                .await;
        }
        if !snapshot.quantity.is_positive() {
            warn!(position_id = %snapshot.id, "Partial close with zero quantity");
            return false;
        }

        let qty_to_close = snapshot.quantity.percent(percent);
        let percentage = qty_to_close.inner() / snapshot.quantity.inner() * HUNDRED;

        let request = ClosePositionRequest {
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            percentage,
        };
        if let Err(e) = self.deps.exchange.close_position(request).await {
            error!(
                position_id = %snapshot.id,
                %percentage,
                error = %e,
                "Partial close rejected by exchange"
            );
            Metrics::partial_close("exiting", "failed");
            return false;
        }

        let applied = position.update(|p| {
            if p.is_closed() {
                return false;
            }
            p.quantity = p.quantity.saturating_sub(qty_to_close);
            true
        });
        if !applied {
            debug!(position_id = %snapshot.id, "Position closed while partial close was in flight");
            return false;
        }

        self.book_partial_fill(&snapshot, qty_to_close, exit_price);

        let gross = pnl_for(snapshot.side, snapshot.entry_price, exit_price, qty_to_close);
        let fees = round_trip_fees(snapshot.entry_price, exit_price, qty_to_close, self.config.fee_rate);
        info!(
            position_id = %snapshot.id,
            exit_type = %exit_type,
            reason = exit_reason,
            closed_qty = %qty_to_close,
            remaining_qty = %position.read(|p| p.quantity),
            %exit_price,
            pnl_gross = %gross,
            fees = %fees,
            "Partial close executed"
        );
        Metrics::partial_close("exiting", "ok");

        self.notify(&format!(
            "Partial close {} {}: {}% @ {} ({}), PnL {:.2}",
            snapshot.symbol,
            snapshot.side,
            percent.normalize(),
            exit_price,
            exit_type,
            gross - fees
        ))
        .await;
        true
    }

    fn book_partial_fill(&self, snapshot: &Position, qty: Size, exit_price: Price) {
        let mut ledger = self.ledger.lock();
        let Some(ledger) = ledger.as_mut() else {
            return;
        };

        let matched = snapshot
            .take_profits
            .iter()
            .filter_map(|tp| {
                exit_price
                    .abs_pct_from(tp.price)
                    .filter(|diff| *diff <= self.config.partial_price_tolerance_percent)
                    .map(|diff| (diff, tp.level))
            })
            .min_by_key(|(diff, _)| *diff);

        match matched {
            Some((_, level)) => ledger.record_partial_close(level, qty, exit_price),
            None => debug!(
                position_id = %snapshot.id,
                %exit_price,
                "Partial close did not match any TP level, ledger not updated"
            ),
        }
    }

    // ========================================================================
    // Full close
    // ========================================================================

    /// Close the whole position exactly once.
    ///
    /// The `Open -> Closed` transition happens before the exchange call; a
    /// caller that finds the position already closed gets `false` and never
    /// reaches the exchange. A genuine exchange failure re-opens the position
    /// so the next trigger can retry.
    pub async fn close_full_position(
        &self,
        position: &SharedPosition,
        exit_price: Price,
        exit_reason: &str,
        exit_type: ExitType,
    ) -> bool {
        if !position.try_mark_closed() {
            debug!(position_id = %position.id(), "Full close on closed position ignored");
            Metrics::duplicate_close("close_full");
            return false;
        }
        let snapshot = position.snapshot();

        let request = ClosePositionRequest {
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            percentage: HUNDRED,
        };
        match self.deps.exchange.close_position(request).await {
            Ok(()) => {}
            Err(e) if e.is_already_closed() => {
                info!(
                    position_id = %snapshot.id,
                    error = %e,
                    "Position already flat on exchange, treating close as success"
                );
            }
            Err(e) => {
                error!(position_id = %snapshot.id, error = %e, "Full close rejected by exchange");
                position.reopen();
                Metrics::exit_action("close_all", "exchange_failed");
                return false;
            }
        }

        if let Err(e) = self
            .deps
            .exchange
            .cancel_all_conditional_orders(&snapshot.symbol)
            .await
        {
            warn!(position_id = %snapshot.id, error = %e, "Failed to cancel conditional orders");
        }

        let (pnl, tp_levels_hit) = self.final_pnl(&snapshot, exit_price);
        let pnl_percent = calculate_pnl_percent(&snapshot, exit_price);
        let now_ms = self.now_ms();
        let holding_time_ms = snapshot.holding_time_ms(now_ms);

        info!(
            position_id = %snapshot.id,
            symbol = %snapshot.symbol,
            side = %snapshot.side,
            exit_type = %exit_type,
            reason = exit_reason,
            %exit_price,
            pnl_net = %pnl.pnl_net,
            fees = %pnl.fees,
            holding_time_ms,
            ?tp_levels_hit,
            "Position closed"
        );

        self.record_close(&snapshot, exit_type, exit_reason, exit_price, pnl, pnl_percent, &tp_levels_hit, now_ms)
            .await;

        Metrics::trade_closed(
            &snapshot.symbol,
            &exit_type.to_string(),
            pnl.pnl_net.to_f64().unwrap_or_default(),
            holding_time_ms,
        );

        self.notify(&format!(
            "Closed {} {} @ {} ({}): PnL {:.2} ({:.2}%), TPs hit {:?}",
            snapshot.symbol,
            snapshot.side,
            exit_price,
            exit_type,
            pnl.pnl_net,
            pnl_percent,
            tp_levels_hit
        ))
        .await;
        true
    }

    /// Realized PnL and the TP levels that contributed to it.
    fn final_pnl(&self, snapshot: &Position, exit_price: Price) -> (FinalPnl, Vec<u8>) {
        let mut tp_levels_hit = snapshot.hit_levels();
        let ledger = self.ledger.lock();
        let pnl = match ledger.as_ref() {
            Some(ledger) => {
                tp_levels_hit.extend(ledger.tp_levels_hit());
                tp_levels_hit.sort_unstable();
                tp_levels_hit.dedup();
                ledger.calculate_final_pnl(exit_price)
            }
            None => {
                let gross = pnl_for(snapshot.side, snapshot.entry_price, exit_price, snapshot.quantity);
                let fees = round_trip_fees(
                    snapshot.entry_price,
                    exit_price,
                    snapshot.quantity,
                    self.config.fee_rate,
                );
                FinalPnl {
                    pnl_gross: gross,
                    pnl_net: gross - fees,
                    fees,
                }
            }
        };
        (pnl, tp_levels_hit)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_close(
        &self,
        snapshot: &Position,
        exit_type: ExitType,
        exit_reason: &str,
        exit_price: Price,
        pnl: FinalPnl,
        pnl_percent: Decimal,
        tp_levels_hit: &[u8],
        now_ms: u64,
    ) {
        let Some(journal_id) = snapshot.journal_id.as_deref() else {
            warn!(
                position_id = %snapshot.id,
                "No journal id on position, skipping journal and session stats"
            );
            return;
        };

        let holding_time_ms = snapshot.holding_time_ms(now_ms);
        let holding = Decimal::from(holding_time_ms);
        let record = TradeCloseRecord {
            journal_id: journal_id.to_string(),
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            exit_type,
            exit_reason: exit_reason.to_string(),
            exit_price,
            quantity: snapshot.quantity,
            realized_pnl: pnl.pnl_net,
            pnl_percent,
            fees: pnl.fees,
            tp_levels_hit: tp_levels_hit.to_vec(),
            holding_time_ms,
            holding_time_minutes: (holding / Decimal::from(60_000)).round_dp(2),
            holding_time_hours: (holding / Decimal::from(3_600_000)).round_dp(2),
            stopped_out: exit_type.is_stop(),
            sl_moved_to_breakeven: snapshot.stop_loss.is_breakeven,
            trailing_stop_activated: snapshot.stop_loss.is_trailing,
            closed_at: now_ms,
        };
        if let Err(e) = self.deps.journal.record_trade_close(record).await {
            error!(position_id = %snapshot.id, journal_id, error = %e, "Failed to record trade close");
        }

        let stats = TradeExitStats {
            exit_price,
            pnl: pnl.pnl_net,
            pnl_percent,
            exit_type,
            tp_hit_levels: tp_levels_hit.to_vec(),
            holding_time_ms,
            stop_loss: StopLossSummary {
                initial: snapshot.stop_loss.initial_price,
                final_price: snapshot.stop_loss.price,
                moved_to_breakeven: snapshot.stop_loss.is_breakeven,
                trailing_activated: snapshot.stop_loss.is_trailing,
            },
        };
        if let Err(e) = self.deps.stats.update_trade_exit(journal_id, stats).await {
            error!(position_id = %snapshot.id, journal_id, error = %e, "Failed to update session stats");
        }
    }

    // ========================================================================
    // Stop-loss
    // ========================================================================

    /// Move the stop-loss to `new_price` if that is strictly more favorable.
    pub async fn update_stop_loss(&self, position: &SharedPosition, new_price: Price) -> bool {
        self.ratchet_stop_loss(position, new_price, "manual").await
    }

    /// Shared ratchet: reject any candidate that is not strictly more
    /// favorable than the current stop, before touching the exchange.
    async fn ratchet_stop_loss(&self, position: &SharedPosition, candidate: Price, kind: &str) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            debug!(position_id = %snapshot.id, kind, "Stop-loss update on closed position ignored");
            return false;
        }
        if !snapshot
            .side
            .is_more_favorable(candidate, snapshot.stop_loss.price)
        {
            debug!(
                position_id = %snapshot.id,
                kind,
                current = %snapshot.stop_loss.price,
                %candidate,
                "Stop-loss update rejected: not more favorable"
            );
            Metrics::sl_update(kind, "rejected");
            return false;
        }

        if !self.push_stop_loss(&snapshot, candidate, kind).await {
            return false;
        }

        let now_ms = self.now_ms();
        let applied = position.update(|p| {
            if p.is_closed() || !p.side.is_more_favorable(candidate, p.stop_loss.price) {
                return false;
            }
            p.stop_loss.price = candidate;
            p.stop_loss.updated_at = now_ms;
            true
        });
        if applied {
            info!(position_id = %snapshot.id, kind, new_sl = %candidate, "Stop-loss moved");
            Metrics::sl_update(kind, "accepted");
        }
        applied
    }

    async fn push_stop_loss(&self, snapshot: &Position, price: Price, kind: &str) -> bool {
        let request = UpdateStopLossRequest {
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            side: snapshot.side,
            new_price: price,
        };
        match self.deps.exchange.update_stop_loss(request).await {
            Ok(()) => true,
            Err(e) => {
                error!(position_id = %snapshot.id, kind, %price, error = %e, "Stop-loss update failed");
                Metrics::sl_update(kind, "failed");
                false
            }
        }
    }

    /// Move the stop to entry plus the configured breakeven margin.
    ///
    /// Skipped when already at breakeven, when the margin would produce a
    /// losing stop, or when the current stop is already past breakeven.
    pub async fn move_stop_loss_to_breakeven(&self, position: &SharedPosition) -> bool {
        self.move_stop_loss_to_breakeven_with(position, self.config.breakeven_margin_percent)
            .await
    }

    /// Breakeven move with an explicit margin instead of the configured one.
    pub async fn move_stop_loss_to_breakeven_with(
        &self,
        position: &SharedPosition,
        margin_percent: Decimal,
    ) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            return false;
        }
        if snapshot.stop_loss.is_breakeven {
            debug!(position_id = %snapshot.id, "Stop-loss already at breakeven");
            return false;
        }

        let breakeven = calculate_breakeven_sl(&snapshot, margin_percent);
        if !is_breakeven_valid(&snapshot, breakeven) {
            warn!(
                position_id = %snapshot.id,
                %breakeven,
                margin = %margin_percent,
                "Breakeven stop would sit on the losing side of entry"
            );
            Metrics::sl_update("breakeven", "rejected");
            return false;
        }
        if !snapshot
            .side
            .is_more_favorable(breakeven, snapshot.stop_loss.price)
        {
            debug!(
                position_id = %snapshot.id,
                current = %snapshot.stop_loss.price,
                %breakeven,
                "Stop-loss already beyond breakeven"
            );
            Metrics::sl_update("breakeven", "rejected");
            return false;
        }

        if !self.push_stop_loss(&snapshot, breakeven, "breakeven").await {
            return false;
        }

        let now_ms = self.now_ms();
        let applied = position.update(|p| {
            if p.is_closed() || !p.side.is_more_favorable(breakeven, p.stop_loss.price) {
                return false;
            }
            p.stop_loss.price = breakeven;
            p.stop_loss.is_breakeven = true;
            p.stop_loss.updated_at = now_ms;
            true
        });
        if applied {
            info!(position_id = %snapshot.id, %breakeven, "Stop-loss moved to breakeven");
            Metrics::sl_update("breakeven", "accepted");
        }
        applied
    }

    /// Start trailing `trailing_distance` behind `current_price`.
    ///
    /// First activation is unconditional; later refinements go through the
    /// ratchet. Uses the venue's native trailing stop when available.
    pub async fn activate_trailing_stop(
        &self,
        position: &SharedPosition,
        trailing_distance: Decimal,
        current_price: Price,
    ) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            return false;
        }
        if trailing_distance <= Decimal::ZERO || !current_price.is_positive() {
            warn!(position_id = %snapshot.id, %trailing_distance, %current_price, "Invalid trailing parameters");
            return false;
        }

        let trailing_price = calculate_current_trailing_sl(&snapshot, current_price, trailing_distance);
        let trailing_percent = if snapshot.entry_price.is_zero() {
            trailing_distance / current_price.inner() * HUNDRED
        } else {
            trailing_distance / snapshot.entry_price.inner() * HUNDRED
        };

        let pushed = match self.deps.exchange.trailing_stop() {
            Some(native) => {
                let request = TrailingStopRequest {
                    symbol: snapshot.symbol.clone(),
                    side: snapshot.side,
                    activation_price: current_price,
                    trailing_percent,
                };
                match native.set_trailing_stop(request).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(position_id = %snapshot.id, error = %e, "Native trailing stop failed");
                        Metrics::sl_update("trailing", "failed");
                        false
                    }
                }
            }
            None => self.push_stop_loss(&snapshot, trailing_price, "trailing").await,
        };
        if !pushed {
            return false;
        }

        let now_ms = self.now_ms();
        let applied = position.update(|p| {
            if p.is_closed() {
                return false;
            }
            p.stop_loss.is_trailing = true;
            p.stop_loss.price = trailing_price;
            p.stop_loss.trailing_percent = Some(trailing_percent);
            p.stop_loss.trailing_activation_price = Some(current_price);
            p.stop_loss.updated_at = now_ms;
            true
        });
        if applied {
            info!(
                position_id = %snapshot.id,
                %trailing_price,
                %trailing_percent,
                "Trailing stop activated"
            );
            Metrics::sl_update("trailing", "accepted");
        }
        applied
    }

    // ========================================================================
    // TP hit
    // ========================================================================

    /// Mark `tp_level` hit exactly once and book the fill.
    ///
    /// Shrinks the local quantity to what the exchange must now hold (never
    /// below a value a WebSocket sync already applied). Returns the slice of
    /// the original quantity the level closed, or `None` for unknown or
    /// already-hit levels.
    pub fn record_take_profit_hit(
        &self,
        position: &SharedPosition,
        tp_level: u8,
        current_price: Price,
    ) -> Option<Size> {
        let now_ms = self.now_ms();
        let slice = position.update(|p| {
            if p.is_closed() {
                return None;
            }
            let initial = p.initial_quantity;
            let tp = p.take_profit_mut(tp_level)?;
            if !tp.mark_hit(now_ms) {
                return None;
            }
            let slice = initial.percent(tp.size_percent);
            let expected = expected_quantity_after_hits(p);
            if p.quantity > expected {
                p.quantity = expected;
            }
            Some(slice)
        });
        let Some(slice) = slice else {
            debug!(position_id = %position.id(), tp_level, "TP level unknown, already hit or position closed");
            return None;
        };

        if let Some(ledger) = self.ledger.lock().as_mut() {
            ledger.record_partial_close(tp_level, slice, current_price);
        }
        Some(slice)
    }

    /// React to a confirmed TP fill.
    ///
    /// Records the hit, then applies the level's stop transition: TP1 moves
    /// the stop to breakeven, the configured level activates trailing.
    /// Returns `false` for unknown or already-hit levels.
    pub async fn on_take_profit_hit(
        &self,
        position: &SharedPosition,
        tp_level: u8,
        current_price: Price,
    ) -> bool {
        let Some(slice) = self.record_take_profit_hit(position, tp_level, current_price) else {
            return false;
        };

        let snapshot = position.snapshot();
        info!(
            position_id = %snapshot.id,
            tp_level,
            %current_price,
            closed_qty = %slice,
            remaining_qty = %snapshot.quantity,
            "Take-profit hit"
        );

        if tp_level == 1 && !snapshot.stop_loss.is_breakeven {
            self.move_stop_loss_to_breakeven(position).await;
        }

        if tp_level == self.config.trailing_activation_level {
            let snapshot = position.snapshot();
            if snapshot.stop_loss.is_trailing {
                debug!(position_id = %snapshot.id, "Trailing already active");
            } else {
                let distance = calculate_trailing_distance(
                    &snapshot,
                    self.config.trailing_stop_percent,
                    None,
                    self.config.atr_multiplier,
                );
                self.activate_trailing_stop(position, distance, current_price)
                    .await;
            }
        }

        self.notify(&format!(
            "TP{} hit {} @ {}, remaining {}",
            tp_level, snapshot.symbol, current_price, snapshot.quantity
        ))
        .await;
        true
    }

    // ========================================================================
    // Periodic refinements
    // ========================================================================

    /// Recompute the trailing stop at the current price and push it only if
    /// it is strictly more favorable. No-op until trailing is active.
    pub async fn update_smart_trailing_v2(
        &self,
        position: &SharedPosition,
        current_price: Price,
        atr_percent: Option<Decimal>,
    ) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() || !snapshot.stop_loss.is_trailing {
            return false;
        }
        let base = snapshot
            .stop_loss
            .trailing_percent
            .unwrap_or(self.config.trailing_stop_percent);
        let distance = calculate_trailing_distance(&snapshot, base, atr_percent, self.config.atr_multiplier);
        let candidate = calculate_current_trailing_sl(&snapshot, current_price, distance);
        self.ratchet_stop_loss(position, candidate, "trailing").await
    }

    /// Push TP3 further out while price runs toward it.
    ///
    /// The candidate target sits `smart_tp3_extension_percent` beyond the
    /// current price and is only sent if it improves on the live TP3.
    pub async fn update_smart_tp3(&self, position: &SharedPosition, current_price: Price) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() {
            return false;
        }
        let Some(tp3) = snapshot.take_profit(3).filter(|tp| !tp.hit) else {
            return false;
        };
        let Some(order_id) = tp3.order_id.clone() else {
            debug!(position_id = %snapshot.id, "TP3 has no order id, cannot amend");
            return false;
        };
        let Some(amender) = self.deps.exchange.take_profit_amender() else {
            debug!(position_id = %snapshot.id, "Exchange cannot amend take-profit orders");
            return false;
        };

        let extension = self.config.smart_tp3_extension_percent / HUNDRED;
        let candidate = Price::new(current_price.inner() * (Decimal::ONE + snapshot.side.sign() * extension));
        if !snapshot.side.is_more_favorable(candidate, tp3.price) {
            return false;
        }

        if let Err(e) = amender.update_take_profit(&order_id, candidate).await {
            error!(position_id = %snapshot.id, error = %e, "TP3 amendment failed");
            return false;
        }

        let applied = position.update(|p| {
            if p.is_closed() {
                return false;
            }
            let side = p.side;
            match p.take_profit_mut(3) {
                Some(tp) if !tp.hit && side.is_more_favorable(candidate, tp.price) => {
                    tp.price = candidate;
                    true
                }
                _ => false,
            }
        });
        if applied {
            info!(position_id = %snapshot.id, new_tp3 = %candidate, "TP3 extended");
        }
        applied
    }

    /// Trail the stop along a Bollinger band level.
    ///
    /// Only while trailing is active, only if the band is on the protective
    /// side of the current price, and only through the ratchet.
    pub async fn update_bb_trailing_stop(
        &self,
        position: &SharedPosition,
        band_price: Price,
        current_price: Price,
    ) -> bool {
        let snapshot = position.snapshot();
        if snapshot.is_closed() || !snapshot.stop_loss.is_trailing {
            return false;
        }
        if !snapshot.side.is_more_favorable(current_price, band_price) {
            debug!(position_id = %snapshot.id, %band_price, %current_price, "Band is past current price");
            return false;
        }
        self.ratchet_stop_loss(position, band_price, "bb").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExchangeError, JournalError};
    use crate::ledger::TakeProfitLedger;
    use crate::ports::{MockNotifier, MockTradeJournal};
    use crate::stub::{MemoryJournal, MemorySessionStats, RecordingNotifier, StubExchange};
    use futbot_core::{ManualClock, PositionSide, PositionStatus, TakeProfit};
    use rust_decimal_macros::dec;

    struct Harness {
        service: PositionExitingService,
        exchange: Arc<StubExchange>,
        journal: Arc<MemoryJournal>,
        stats: Arc<MemorySessionStats>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness_with(exchange: StubExchange, config: ExitConfig) -> Harness {
        let exchange = Arc::new(exchange);
        let journal = Arc::new(MemoryJournal::new());
        let stats = Arc::new(MemorySessionStats::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let deps = ExitDeps {
            exchange: exchange.clone(),
            journal: journal.clone(),
            stats: stats.clone(),
            notifier: notifier.clone(),
            clock: Arc::new(ManualClock::new(600_000)),
        };
        Harness {
            service: PositionExitingService::new(deps, config),
            exchange,
            journal,
            stats,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(
            StubExchange::new(),
            ExitConfig {
                fee_rate: Decimal::ZERO,
                ..ExitConfig::default()
            },
        )
    }

    fn long_position(journal_id: Option<String>) -> SharedPosition {
        let mut pos = Position::open(
            "BTCUSDT",
            PositionSide::Long,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
            dec!(10),
            Price::new(dec!(95)),
            vec![
                TakeProfit::new(1, dec!(5), dec!(33), Price::new(dec!(105))).with_order_id("tp-1"),
                TakeProfit::new(2, dec!(10), dec!(33), Price::new(dec!(110))).with_order_id("tp-2"),
                TakeProfit::new(3, dec!(15), dec!(34), Price::new(dec!(115))).with_order_id("tp-3"),
            ],
            0,
        );
        pos.journal_id = journal_id;
        SharedPosition::new(pos)
    }

    fn short_position() -> SharedPosition {
        SharedPosition::new(Position::open(
            "BTCUSDT",
            PositionSide::Short,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
            dec!(10),
            Price::new(dec!(105)),
            vec![],
            0,
        ))
    }

    // ========================================================================
    // Dispatcher
    // ========================================================================

    #[tokio::test]
    async fn test_action_on_closed_position_never_reaches_exchange() {
        let h = harness();
        let pos = long_position(None);
        pos.try_mark_closed();

        for action in [
            ExitAction::CloseAll,
            ExitAction::ClosePercent { percent: dec!(50) },
            ExitAction::UpdateSl { new_stop_loss: Price::new(dec!(99)) },
            ExitAction::MoveSlToBreakeven,
        ] {
            let ok = h
                .service
                .execute_exit_action(&pos, &action, Price::new(dec!(100)), "test", ExitType::Manual)
                .await;
            assert!(!ok);
        }
        assert_eq!(h.exchange.close_count(), 0);
        assert_eq!(h.exchange.stop_loss_update_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_activate_trailing() {
        let h = harness();
        let pos = long_position(None);
        let ok = h
            .service
            .execute_exit_action(
                &pos,
                &ExitAction::ActivateTrailing { trailing_percent: dec!(2) },
                Price::new(dec!(112)),
                "trail",
                ExitType::TrailingStop,
            )
            .await;
        assert!(ok);
        let sl = pos.snapshot().stop_loss;
        assert!(sl.is_trailing);
        assert_eq!(sl.price, Price::new(dec!(110)));
        assert_eq!(sl.trailing_percent, Some(dec!(2)));
    }

    // ========================================================================
    // Partial close
    // ========================================================================

    #[tokio::test]
    async fn test_partial_close_quantities() {
        let h = harness();
        let pos = long_position(None);

        assert!(
            h.service
                .execute_exit_action(
                    &pos,
                    &ExitAction::ClosePercent { percent: dec!(25) },
                    Price::new(dec!(104)),
                    "partial",
                    ExitType::Manual,
                )
                .await
        );
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(7.5)));

        let pos = long_position(None);
        assert!(
            h.service
                .close_partial_position(&pos, dec!(50), Price::new(dec!(104)), "half", ExitType::Manual)
                .await
        );
        let snap = pos.snapshot();
        assert_eq!(snap.quantity, Size::new(dec!(5)));
        assert_eq!(snap.entry_price, Price::new(dec!(100)));
        assert_eq!(h.exchange.calls().closes[1].percentage, dec!(50));
    }

    #[tokio::test]
    async fn test_partial_close_failure_keeps_quantity() {
        let h = harness();
        let pos = long_position(None);
        h.exchange.fail_next_close(ExchangeError::Network("timeout".into()));

        let ok = h
            .service
            .close_partial_position(&pos, dec!(50), Price::new(dec!(104)), "half", ExitType::Manual)
            .await;
        assert!(!ok);
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(10)));
    }

    #[tokio::test]
    async fn test_partial_close_guard_on_closed_position() {
        let h = harness();
        let pos = long_position(None);
        pos.try_mark_closed();
        assert!(
            !h.service
                .close_partial_position(&pos, dec!(50), Price::new(dec!(104)), "x", ExitType::Manual)
                .await
        );
        assert_eq!(h.exchange.close_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_close_books_ledger_by_price() {
        let h = harness();
        let pos = long_position(None);
        h.service.attach_ledger(Box::new(TakeProfitLedger::new(
            PositionSide::Long,
            Price::new(dec!(100)),
            Size::new(dec!(10)),
            Decimal::ZERO,
        )));

        // 109.5 is within 1% of TP2 (110)
        h.service
            .close_partial_position(&pos, dec!(30), Price::new(dec!(109.5)), "tp", ExitType::TakeProfit { level: 2 })
            .await;
        // 120 matches nothing
        h.service
            .close_partial_position(&pos, dec!(10), Price::new(dec!(120)), "x", ExitType::Manual)
            .await;

        let ledger = h.service.detach_ledger().unwrap();
        assert_eq!(ledger.tp_levels_hit(), vec![2]);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_undo_partial() {
        let h = harness();
        h.notifier.set_fail(true);
        let pos = long_position(None);
        assert!(
            h.service
                .close_partial_position(&pos, dec!(50), Price::new(dec!(104)), "half", ExitType::Manual)
                .await
        );
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(5)));
    }

    // ========================================================================
    // Full close
    // ========================================================================

    #[tokio::test]
    async fn test_full_close_records_and_cancels() {
        let h = harness();
        let journal_id = h.journal.open_trade();
        let pos = long_position(Some(journal_id.clone()));

        assert!(
            h.service
                .close_full_position(&pos, Price::new(dec!(110)), "tp", ExitType::TakeProfit { level: 2 })
                .await
        );
        assert_eq!(pos.snapshot().status, PositionStatus::Closed);
        assert_eq!(h.exchange.full_close_count(), 1);
        assert_eq!(h.exchange.cancel_count(), 1);

        let closes = h.journal.closes();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].realized_pnl, dec!(100));
        assert_eq!(closes[0].holding_time_ms, 600_000);
        assert_eq!(closes[0].holding_time_minutes, dec!(10));
        assert!(!closes[0].stopped_out);

        let exits = h.stats.exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].0, journal_id);
        assert_eq!(h.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_second_full_close_is_rejected() {
        let h = harness();
        let pos = long_position(None);
        assert!(h.service.close_full_position(&pos, Price::new(dec!(100)), "a", ExitType::Manual).await);
        assert!(!h.service.close_full_position(&pos, Price::new(dec!(100)), "b", ExitType::Manual).await);
        assert_eq!(h.exchange.close_count(), 1);
    }

    #[tokio::test]
    async fn test_full_close_already_closed_on_exchange_is_success() {
        let h = harness();
        let pos = long_position(None);
        h.exchange
            .fail_next_close(ExchangeError::ReduceOnlyRejected("position is zero".into()));

        assert!(h.service.close_full_position(&pos, Price::new(dec!(95)), "sl", ExitType::StopLoss).await);
        assert!(pos.is_closed());
    }

    #[tokio::test]
    async fn test_full_close_exchange_failure_reopens() {
        let h = harness();
        let pos = long_position(None);
        h.exchange.fail_next_close(ExchangeError::RateLimited);

        assert!(!h.service.close_full_position(&pos, Price::new(dec!(95)), "sl", ExitType::StopLoss).await);
        assert!(!pos.is_closed());

        // next trigger retries and wins
        assert!(h.service.close_full_position(&pos, Price::new(dec!(95)), "sl", ExitType::StopLoss).await);
    }

    #[tokio::test]
    async fn test_full_close_without_journal_id_skips_recording() {
        let h = harness();
        let pos = long_position(None);
        assert!(h.service.close_full_position(&pos, Price::new(dec!(100)), "x", ExitType::External).await);
        assert!(h.journal.closes().is_empty());
        assert!(h.stats.exits().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_failure_is_not_fatal() {
        let h = harness();
        h.exchange.set_fail_cancels(true);
        let pos = long_position(None);
        assert!(h.service.close_full_position(&pos, Price::new(dec!(100)), "x", ExitType::Manual).await);
    }

    #[tokio::test]
    async fn test_journal_failure_still_reports_close() {
        let exchange = Arc::new(StubExchange::new());
        let mut journal = MockTradeJournal::new();
        journal
            .expect_record_trade_close()
            .times(1)
            .returning(|_| Err(JournalError::Write("disk full".into())));
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send_alert()
            .times(1)
            .returning(|_| Err(crate::error::NotifyError::Delivery("down".into())));

        let service = PositionExitingService::new(
            ExitDeps {
                exchange: exchange.clone(),
                journal: Arc::new(journal),
                stats: Arc::new(MemorySessionStats::new()),
                notifier: Arc::new(notifier),
                clock: Arc::new(ManualClock::new(0)),
            },
            ExitConfig::default(),
        );
        let pos = long_position(Some("journal-1".into()));
        assert!(service.close_full_position(&pos, Price::new(dec!(90)), "sl", ExitType::StopLoss).await);
        assert_eq!(exchange.full_close_count(), 1);
    }

    // ========================================================================
    // Stop-loss ratchet
    // ========================================================================

    #[tokio::test]
    async fn test_monotonic_stop_loss_long() {
        let h = harness();
        let pos = long_position(None);

        assert!(h.service.update_stop_loss(&pos, Price::new(dec!(101))).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(101)));

        assert!(!h.service.update_stop_loss(&pos, Price::new(dec!(98))).await);
        assert!(!h.service.update_stop_loss(&pos, Price::new(dec!(101))).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(101)));
        assert_eq!(h.exchange.stop_loss_update_count(), 1);
    }

    #[tokio::test]
    async fn test_monotonic_stop_loss_short() {
        let h = harness();
        let pos = short_position();

        assert!(!h.service.update_stop_loss(&pos, Price::new(dec!(106))).await);
        assert!(h.service.update_stop_loss(&pos, Price::new(dec!(99))).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(99)));
    }

    #[tokio::test]
    async fn test_stop_loss_exchange_failure_leaves_state() {
        let h = harness();
        let pos = long_position(None);
        h.exchange.fail_next_stop_loss(ExchangeError::Network("reset".into()));
        assert!(!h.service.update_stop_loss(&pos, Price::new(dec!(99))).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(95)));
    }

    #[tokio::test]
    async fn test_breakeven_once() {
        let h = harness();
        let pos = long_position(None);
        assert!(h.service.move_stop_loss_to_breakeven(&pos).await);
        let sl = pos.snapshot().stop_loss;
        assert!(sl.is_breakeven);
        assert_eq!(sl.price, Price::new(dec!(100.3)));

        assert!(!h.service.move_stop_loss_to_breakeven(&pos).await);
        assert_eq!(h.exchange.stop_loss_update_count(), 1);
    }

    #[tokio::test]
    async fn test_breakeven_rejects_negative_margin() {
        let h = harness_with(
            StubExchange::new(),
            ExitConfig {
                breakeven_margin_percent: dec!(-0.5),
                ..ExitConfig::default()
            },
        );
        let pos = long_position(None);
        assert!(!h.service.move_stop_loss_to_breakeven(&pos).await);
        assert_eq!(h.exchange.stop_loss_update_count(), 0);
    }

    #[tokio::test]
    async fn test_native_trailing_used_when_supported() {
        let h = harness_with(StubExchange::new().with_native_trailing(), ExitConfig::default());
        let pos = long_position(None);
        assert!(h.service.activate_trailing_stop(&pos, dec!(1), Price::new(dec!(110))).await);

        let calls = h.exchange.calls();
        assert_eq!(calls.trailing_stops.len(), 1);
        assert_eq!(calls.trailing_stops[0].activation_price, Price::new(dec!(110)));
        assert!(calls.stop_loss_updates.is_empty());
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(109)));
    }

    // ========================================================================
    // TP hit
    // ========================================================================

    #[tokio::test]
    async fn test_tp1_moves_to_breakeven_and_shrinks_quantity() {
        let h = harness();
        let pos = long_position(None);

        assert!(h.service.on_take_profit_hit(&pos, 1, Price::new(dec!(105))).await);
        let snap = pos.snapshot();
        assert_eq!(snap.quantity, Size::new(dec!(6.7)));
        assert!(snap.stop_loss.is_breakeven);
        assert!(!snap.stop_loss.is_trailing);
        let tp1 = snap.take_profit(1).unwrap();
        assert!(tp1.hit);
        assert!(tp1.order_id.is_none());
        assert_eq!(snap.entry_price, Price::new(dec!(100)));
    }

    #[tokio::test]
    async fn test_duplicate_tp_event_is_noop() {
        let h = harness();
        let pos = long_position(None);
        assert!(h.service.on_take_profit_hit(&pos, 1, Price::new(dec!(105))).await);
        let updates = h.exchange.stop_loss_update_count();

        assert!(!h.service.on_take_profit_hit(&pos, 1, Price::new(dec!(105))).await);
        assert!(!h.service.on_take_profit_hit(&pos, 9, Price::new(dec!(105))).await);
        assert_eq!(h.exchange.stop_loss_update_count(), updates);
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(6.7)));
    }

    #[tokio::test]
    async fn test_tp_hit_after_ws_sync_does_not_double_reduce() {
        let h = harness();
        let pos = long_position(None);
        pos.update(|p| p.quantity = Size::new(dec!(6.7)));

        h.service.on_take_profit_hit(&pos, 1, Price::new(dec!(105))).await;
        assert_eq!(pos.snapshot().quantity, Size::new(dec!(6.7)));
    }

    #[tokio::test]
    async fn test_trailing_level_activates_trailing() {
        let h = harness();
        let pos = long_position(None);
        h.service.on_take_profit_hit(&pos, 1, Price::new(dec!(105))).await;
        h.service.on_take_profit_hit(&pos, 2, Price::new(dec!(110))).await;

        let sl = pos.snapshot().stop_loss;
        assert!(sl.is_trailing);
        assert!(sl.is_breakeven);
        assert_eq!(sl.price, Price::new(dec!(109)));
    }

    // ========================================================================
    // Periodic refinements
    // ========================================================================

    #[tokio::test]
    async fn test_smart_trailing_ratchets() {
        let h = harness();
        let pos = long_position(None);
        assert!(!h.service.update_smart_trailing_v2(&pos, Price::new(dec!(120)), None).await);

        h.service.activate_trailing_stop(&pos, dec!(1), Price::new(dec!(110))).await;
        assert!(h.service.update_smart_trailing_v2(&pos, Price::new(dec!(112)), None).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(111)));

        // price pulls back: candidate 110 is worse than 111
        let before = h.exchange.stop_loss_update_count();
        assert!(!h.service.update_smart_trailing_v2(&pos, Price::new(dec!(111)), None).await);
        assert_eq!(h.exchange.stop_loss_update_count(), before);
    }

    #[tokio::test]
    async fn test_smart_tp3_extends_only_forward() {
        let h = harness_with(StubExchange::new().with_take_profit_amend(), ExitConfig::default());
        let pos = long_position(None);

        // 114.8 * 1.005 = 115.374 > 115
        assert!(h.service.update_smart_tp3(&pos, Price::new(dec!(114.8))).await);
        assert_eq!(pos.snapshot().take_profit(3).unwrap().price, Price::new(dec!(115.374)));

        // 110 * 1.005 = 110.55 < 115.374
        assert!(!h.service.update_smart_tp3(&pos, Price::new(dec!(110))).await);
        assert_eq!(h.exchange.calls().take_profit_amends.len(), 1);
    }

    #[tokio::test]
    async fn test_smart_tp3_skipped_when_closed_during_amend() {
        let h = harness_with(StubExchange::new().with_take_profit_amend(), ExitConfig::default());
        h.exchange.set_latency(std::time::Duration::from_millis(30));
        let pos = long_position(None);

        let (applied, _) = tokio::join!(h.service.update_smart_tp3(&pos, Price::new(dec!(114.8))), async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            pos.try_mark_closed();
        });

        assert!(!applied);
        assert_eq!(pos.snapshot().take_profit(3).unwrap().price, Price::new(dec!(115)));
    }

    #[tokio::test]
    async fn test_smart_tp3_requires_capability() {
        let h = harness();
        let pos = long_position(None);
        assert!(!h.service.update_smart_tp3(&pos, Price::new(dec!(114.8))).await);
    }

    #[tokio::test]
    async fn test_bb_trailing_stop() {
        let h = harness();
        let pos = long_position(None);
        h.service.activate_trailing_stop(&pos, dec!(1), Price::new(dec!(110))).await;

        // band above price is not a valid stop
        assert!(!h.service.update_bb_trailing_stop(&pos, Price::new(dec!(112)), Price::new(dec!(111))).await);
        assert!(h.service.update_bb_trailing_stop(&pos, Price::new(dec!(110)), Price::new(dec!(111))).await);
        assert_eq!(pos.snapshot().stop_loss.price, Price::new(dec!(110)));
    }
}
