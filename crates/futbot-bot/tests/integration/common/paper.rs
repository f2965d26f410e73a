//! Paper application fixtures.
//!
//! LONG 10 BTCUSDT @ 100, SL 95. Strategy levels: 105 (33%, breakeven),
//! 110 (33%, trailing), 120 (34%, close).

#![allow(dead_code)]

use futbot_bot::{AppConfig, Application};

pub const START_MS: u64 = 1_000;

const BASE: &str = r#"
[[exit_strategy.levels]]
level = 1
profit_percent = 5
size_percent = 33
on_hit = ["move_to_breakeven"]

[[exit_strategy.levels]]
level = 2
profit_percent = 10
size_percent = 33
on_hit = ["activate_trailing"]

[[exit_strategy.levels]]
level = 3
profit_percent = 20
size_percent = 34
on_hit = ["close_position"]

[paper]
exit_mode = "MODE"

[paper.position]
id = "BTCUSDT_LONG"
symbol = "BTCUSDT"
side = "LONG"
entryPrice = "100"
quantity = "10"
leverage = 10
stopLoss = { price = "95" }
"#;

/// Config for `mode` with `extra` TOML tables prepended.
pub fn config_toml(mode: &str, extra: &str) -> String {
    format!("{extra}\n{}", BASE.replace("MODE", mode))
}

pub fn config(mode: &str) -> AppConfig {
    AppConfig::from_toml(&config_toml(mode, "")).unwrap()
}

/// Application on a manual clock with the paper position already open.
pub fn paper_app(config: AppConfig) -> Application {
    let mut app = Application::with_manual_clock(config, START_MS).unwrap();
    app.open_paper_position().unwrap();
    app
}

/// One JSON line per price.
pub fn prices(prices: &[&str]) -> String {
    prices
        .iter()
        .map(|p| format!("{{\"type\":\"price\",\"price\":\"{p}\"}}\n"))
        .collect()
}
