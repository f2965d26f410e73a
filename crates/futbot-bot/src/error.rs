//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ladder configuration error: {0}")]
    Ladder(#[from] futbot_position::LadderConfigError),

    #[error("Position error: {0}")]
    Position(#[from] futbot_position::PositionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] futbot_telemetry::TelemetryError),

    #[error("Replay error at line {line}: {message}")]
    Replay { line: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
