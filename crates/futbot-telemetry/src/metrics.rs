//! Prometheus metrics for the futbot exit subsystem.
//!
//! Covers:
//! - Exit actions and their outcome
//! - Duplicate close attempts rejected by the status guard
//! - TP-level match tiers (how often the matcher is guessing)
//! - Stop-loss movements (breakeven, trailing, manual)
//! - Closed trades, realized PnL and holding time
//! - Validation rejections at the wire boundary
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A failure means a
//! duplicate metric name, which should crash at startup. These panics only
//! occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

use crate::error::{TelemetryError, TelemetryResult};

/// Exit actions executed.
/// Labels: action (close_percent/close_all/update_sl/...), outcome (ok/failed/skipped)
pub static EXIT_ACTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_exit_actions_total",
        "Exit actions executed by outcome",
        &["action", "outcome"]
    )
    .unwrap()
});

/// Close attempts rejected because the position was already closed.
pub static DUPLICATE_CLOSE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_duplicate_close_total",
        "Close attempts rejected by the exactly-once guard",
        &["source"]
    )
    .unwrap()
});

/// TP-level resolutions by matcher tier.
/// Labels: tier (order_id/price/quantity/last_resort/unresolved)
pub static TP_MATCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_tp_match_total",
        "TP fill events resolved per matcher tier",
        &["tier"]
    )
    .unwrap()
});

/// Stop-loss movement attempts.
/// Labels: kind (breakeven/trailing/manual/ladder), outcome (accepted/rejected/failed)
pub static SL_UPDATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_sl_updates_total",
        "Stop-loss update attempts",
        &["kind", "outcome"]
    )
    .unwrap()
});

/// Partial closes sent to the exchange.
pub static PARTIAL_CLOSES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_partial_closes_total",
        "Partial closes by source and outcome",
        &["source", "outcome"]
    )
    .unwrap()
});

/// Fully closed trades.
pub static TRADES_CLOSED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_trades_closed_total",
        "Closed trades by exit type",
        &["exit_type"]
    )
    .unwrap()
});

/// Realized net PnL per closed trade (quote currency).
pub static REALIZED_PNL: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "futbot_realized_pnl",
        "Realized net PnL per closed trade",
        &["symbol"],
        vec![-500.0, -100.0, -50.0, -10.0, -1.0, 0.0, 1.0, 10.0, 50.0, 100.0, 500.0]
    )
    .unwrap()
});

/// Holding time per closed trade in seconds.
pub static HOLDING_TIME_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "futbot_holding_time_seconds",
        "Position holding time in seconds",
        &["exit_type"],
        vec![10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 14400.0, 86400.0]
    )
    .unwrap()
});

/// Snapshots or events rejected by validation.
pub static VALIDATION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "futbot_validation_rejected_total",
        "Inbound data rejected by validation",
        &["source"]
    )
    .unwrap()
});

/// Whether a position is currently tracked (1) or not (0).
pub static POSITION_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("futbot_position_open", "Tracked position present (1=open)").unwrap()
});

/// Metrics facade for convenient access.
pub struct Metrics;

impl Metrics {
    /// Record an exit action outcome.
    pub fn exit_action(action: &str, outcome: &str) {
        EXIT_ACTIONS_TOTAL.with_label_values(&[action, outcome]).inc();
    }

    /// Record a rejected duplicate close.
    pub fn duplicate_close(source: &str) {
        DUPLICATE_CLOSE_TOTAL.with_label_values(&[source]).inc();
    }

    /// Record the tier that resolved a TP fill.
    pub fn tp_matched(tier: &str) {
        TP_MATCH_TOTAL.with_label_values(&[tier]).inc();
    }

    pub fn sl_update(kind: &str, outcome: &str) {
        SL_UPDATES_TOTAL.with_label_values(&[kind, outcome]).inc();
    }

    pub fn partial_close(source: &str, outcome: &str) {
        PARTIAL_CLOSES_TOTAL
            .with_label_values(&[source, outcome])
            .inc();
    }

    /// Record a fully closed trade.
    pub fn trade_closed(symbol: &str, exit_type: &str, pnl_net: f64, holding_ms: u64) {
        TRADES_CLOSED_TOTAL.with_label_values(&[exit_type]).inc();
        REALIZED_PNL.with_label_values(&[symbol]).observe(pnl_net);
        HOLDING_TIME_SECONDS
            .with_label_values(&[exit_type])
            .observe(holding_ms as f64 / 1000.0);
    }

    pub fn validation_rejected(source: &str) {
        VALIDATION_REJECTED_TOTAL.with_label_values(&[source]).inc();
    }

    pub fn position_opened() {
        POSITION_OPEN.set(1);
    }

    pub fn position_cleared() {
        POSITION_OPEN.set(0);
    }

    /// Render the default registry in Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
