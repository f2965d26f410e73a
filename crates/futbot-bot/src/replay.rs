//! JSON-lines event replay for paper mode.
//!
//! Each line is either a replay command (`price`, `advance`) or a WebSocket
//! event in its wire shape:
//!
//! ```text
//! {"type":"price","price":"105.2"}
//! {"type":"advance","ms":60000}
//! {"type":"takeProfitFilled","orderId":"paper-tp-1","avgPrice":"105"}
//! {"type":"positionClosed"}
//! ```

use futbot_core::parse_wire_decimal;
use futbot_core::Price;
use futbot_position::WsEvent;
use serde::Deserialize;
use serde_json::Value;

/// Commands that drive the paper venue rather than the bot.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplayCommand {
    Price { price: Value },
    Advance { ms: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayLine {
    Price(Price),
    Advance(u64),
    Ws(WsEvent),
    /// Blank line or comment.
    Skip,
}

/// Parse one line. `Err` means the line is not a JSON object at all;
/// a well-formed object with bad content is reported as `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<ReplayLine>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Some(ReplayLine::Skip));
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Err(format!("expected a JSON object, got {value}"));
    }

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let parsed = match kind {
        "price" | "advance" => match serde_json::from_value::<ReplayCommand>(value) {
            Ok(ReplayCommand::Price { price }) => parse_wire_decimal(&price)
                .map(Price::new)
                .filter(Price::is_positive)
                .map(ReplayLine::Price),
            Ok(ReplayCommand::Advance { ms }) => Some(ReplayLine::Advance(ms)),
            Err(_) => None,
        },
        _ => serde_json::from_value::<WsEvent>(value).ok().map(ReplayLine::Ws),
    };
    Ok(parsed)
}
