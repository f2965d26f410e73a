//! Application configuration.

use crate::error::{AppError, AppResult};
use futbot_position::{
    ExitConfig, ExitStrategyConfig, LadderTpConfig, MonitorConfig, PositionSnapshot,
    TpMatcherConfig,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How take-profit levels are driven in paper mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// TP fills go through the WebSocket handler and the exiting service.
    #[default]
    Events,
    /// TP hits go through the config-driven exit event handler.
    Strategy,
    /// Price-driven ladder; the position carries no TP orders.
    Ladder,
}

/// Paper trading session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default)]
    pub exit_mode: ExitMode,
    /// Position to trade, in exchange snapshot shape.
    pub position: PositionSnapshot,
    /// JSON-lines event file to replay. Without it the bot idles on the
    /// monitor loop until Ctrl-C.
    #[serde(default)]
    pub replay_file: Option<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub matcher: TpMatcherConfig,
    #[serde(default)]
    pub exit_strategy: ExitStrategyConfig,
    #[serde(default)]
    pub ladder: LadderTpConfig,
    #[serde(default)]
    pub time_stop: MonitorConfig,
    pub paper: PaperConfig,
}

impl AppConfig {
    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks that serde defaults cannot express.
    pub fn validate(&self) -> AppResult<()> {
        if self.paper.exit_mode == ExitMode::Ladder {
            self.ladder.validate()?;
        } else if self.exit_strategy.levels.is_empty() {
            return Err(AppError::Config(
                "exit_strategy needs at least one level unless exit_mode is ladder".to_string(),
            ));
        }
        if self.time_stop.check_interval_ms == 0 {
            return Err(AppError::Config(
                "time_stop.check_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
