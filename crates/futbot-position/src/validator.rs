//! Position validation at the wire boundary.
//!
//! Exchange and persisted snapshots arrive as loosely typed JSON; numeric
//! fields may be numbers, numeric strings, empty strings or `"NaN"`. Nothing
//! reaches a typed [`PositionUpdate`] without passing through here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use futbot_core::{parse_wire_decimal, Position, PositionSide, Price, Size, TakeProfit};

use crate::error::{PositionError, PositionResult, ValidationError};

/// Untrusted position snapshot as received from WebSocket or storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub symbol: Value,
    #[serde(default)]
    pub side: Value,
    #[serde(default)]
    pub entry_price: Value,
    #[serde(default)]
    pub quantity: Value,
    #[serde(default, rename = "unrealizedPnL", alias = "unrealizedPnl")]
    pub unrealized_pnl: Value,
    #[serde(default)]
    pub leverage: Value,
    #[serde(default)]
    pub margin_used: Value,
    #[serde(default)]
    pub stop_loss: Value,
    #[serde(default)]
    pub take_profits: Value,
}

impl PositionSnapshot {
    /// Parse a raw JSON value, rejecting null and non-object payloads.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Null => Err(single("position is null")),
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| single(&format!("position is malformed: {e}"))),
            other => Err(single(&format!("position is not an object (got {other})"))),
        }
    }
}

/// Typed, validated position fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    pub id: String,
    pub symbol: String,
    pub side: Option<PositionSide>,
    pub entry_price: Price,
    pub quantity: Size,
    pub unrealized_pnl: Decimal,
    pub leverage: Option<Decimal>,
}

fn single(message: &str) -> ValidationError {
    ValidationError {
        violations: vec![message.to_string()],
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "missing".to_string(),
        Value::String(s) if s.is_empty() => "empty string".to_string(),
        other => other.to_string(),
    }
}

/// Validate a snapshot before monitoring trusts it.
///
/// Collects every violation instead of stopping at the first. Callers treat
/// an error as fatal for the triggering operation.
pub fn validate_for_monitoring(snapshot: &PositionSnapshot) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if non_empty_str(&snapshot.id).is_none() {
        violations.push(format!("id must be a non-empty string (got {})", describe(&snapshot.id)));
    }
    if non_empty_str(&snapshot.symbol).is_none() {
        violations.push(format!(
            "symbol must be a non-empty string (got {})",
            describe(&snapshot.symbol)
        ));
    }

    for (name, value) in [
        ("entryPrice", &snapshot.entry_price),
        ("quantity", &snapshot.quantity),
        ("unrealizedPnL", &snapshot.unrealized_pnl),
        ("leverage", &snapshot.leverage),
    ] {
        if parse_wire_decimal(value).is_none() {
            violations.push(format!("{name} must be a finite number (got {})", describe(value)));
        }
    }

    if !snapshot.take_profits.is_array() {
        violations.push(format!(
            "takeProfits must be an array (got {})",
            describe(&snapshot.take_profits)
        ));
    }

    match &snapshot.stop_loss {
        Value::Null => {}
        Value::Object(sl) => {
            if let Some(price) = sl.get("price") {
                if parse_wire_decimal(price).is_none() {
                    violations.push(format!(
                        "stopLoss.price must be a finite number (got {})",
                        describe(price)
                    ));
                }
            }
        }
        other => violations.push(format!("stopLoss must be an object (got {other})")),
    }

    if !snapshot.side.is_null() {
        let valid = matches!(snapshot.side.as_str(), Some("LONG") | Some("SHORT"));
        if !valid {
            violations.push(format!(
                "side must be LONG or SHORT (got {})",
                describe(&snapshot.side)
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

/// Backfill `unrealizedPnL` and `marginUsed` on legacy snapshots that lack them.
///
/// Only missing (null) fields are filled; present but corrupt values are left
/// for [`validate_for_monitoring`] to reject.
pub fn fill_missing_fields(snapshot: &mut PositionSnapshot, current_price: Price) {
    let entry = parse_wire_decimal(&snapshot.entry_price);
    let quantity = parse_wire_decimal(&snapshot.quantity);
    let (Some(entry), Some(quantity)) = (entry, quantity) else {
        return;
    };

    if snapshot.unrealized_pnl.is_null() {
        let side = snapshot
            .side
            .as_str()
            .and_then(PositionSide::parse)
            .unwrap_or(PositionSide::Long);
        let pnl = (current_price.inner() - entry) * quantity * side.sign();
        snapshot.unrealized_pnl = Value::String(pnl.to_string());
    }

    if snapshot.margin_used.is_null() {
        let leverage = parse_wire_decimal(&snapshot.leverage)
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(Decimal::ONE);
        snapshot.margin_used = Value::String((entry * quantity / leverage).to_string());
    }
}

/// Checks applied to a WebSocket position frame before it is synced.
///
/// Stricter than monitoring on the numerics (entry and quantity must be
/// positive) and lenient on the rest: a missing PnL reads as zero.
pub fn validate_ws_update(snapshot: &PositionSnapshot) -> Result<PositionUpdate, ValidationError> {
    let mut violations = Vec::new();

    let id = non_empty_str(&snapshot.id);
    if id.is_none() {
        violations.push(format!("id must be a non-empty string (got {})", describe(&snapshot.id)));
    }
    let symbol = non_empty_str(&snapshot.symbol);
    if symbol.is_none() {
        violations.push(format!(
            "symbol must be a non-empty string (got {})",
            describe(&snapshot.symbol)
        ));
    }

    let entry = parse_wire_decimal(&snapshot.entry_price).filter(|p| *p > Decimal::ZERO);
    if entry.is_none() {
        violations.push(format!(
            "entryPrice must be a finite positive number (got {})",
            describe(&snapshot.entry_price)
        ));
    }
    let quantity = parse_wire_decimal(&snapshot.quantity).filter(|q| *q > Decimal::ZERO);
    if quantity.is_none() {
        violations.push(format!(
            "quantity must be a finite positive number (got {})",
            describe(&snapshot.quantity)
        ));
    }

    let unrealized_pnl = if snapshot.unrealized_pnl.is_null() {
        Some(Decimal::ZERO)
    } else {
        parse_wire_decimal(&snapshot.unrealized_pnl)
    };
    if unrealized_pnl.is_none() {
        violations.push(format!(
            "unrealizedPnL must be a finite number (got {})",
            describe(&snapshot.unrealized_pnl)
        ));
    }

    match (id, symbol, entry, quantity, unrealized_pnl) {
        (Some(id), Some(symbol), Some(entry), Some(quantity), Some(pnl))
            if violations.is_empty() =>
        {
            Ok(PositionUpdate {
                id: id.to_string(),
                symbol: symbol.to_string(),
                side: snapshot.side.as_str().and_then(PositionSide::parse),
                entry_price: Price::new(entry),
                quantity: Size::new(quantity),
                unrealized_pnl: pnl,
                leverage: parse_wire_decimal(&snapshot.leverage),
            })
        }
        _ => Err(ValidationError { violations }),
    }
}

/// Build a tracked position from an exchange snapshot, e.g. one found open
/// at startup.
///
/// The snapshot must pass [`validate_for_monitoring`] and carry a side and a
/// stop-loss price; the TP ladder comes from the caller's strategy.
pub fn adopt_position(
    snapshot: &PositionSnapshot,
    take_profits: Vec<TakeProfit>,
    opened_at: u64,
) -> PositionResult<Position> {
    validate_for_monitoring(snapshot)?;

    let symbol = non_empty_str(&snapshot.symbol).unwrap_or_default();
    let side = snapshot
        .side
        .as_str()
        .and_then(PositionSide::parse)
        .ok_or_else(|| PositionError::InvalidState(format!("{symbol}: position side is missing")))?;
    let stop_loss = snapshot
        .stop_loss
        .get("price")
        .and_then(parse_wire_decimal)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| PositionError::InvalidState(format!("{symbol}: stop-loss price is missing")))?;
    let entry = parse_wire_decimal(&snapshot.entry_price).unwrap_or_default();
    let quantity = parse_wire_decimal(&snapshot.quantity).unwrap_or_default();
    if entry <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Err(PositionError::InvalidState(format!(
            "{symbol}: entry price and quantity must be positive"
        )));
    }
    let leverage = parse_wire_decimal(&snapshot.leverage).unwrap_or(Decimal::ONE);

    let mut position = Position::open(
        symbol,
        side,
        Price::new(entry),
        Size::new(quantity),
        leverage,
        Price::new(stop_loss),
        take_profits,
        opened_at,
    );
    if let Some(pnl) = parse_wire_decimal(&snapshot.unrealized_pnl) {
        position.unrealized_pnl = pnl;
    }
    Ok(position)
}
