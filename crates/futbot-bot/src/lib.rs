//! Futures exit bot.
//!
//! Paper-trading application around the exit subsystem:
//! - Configuration loading and cross-section validation
//! - Position adoption from an exchange-shaped snapshot
//! - Paper venue that fills SL/TP orders on replayed prices
//! - JSON-lines event replay
//! - Time-stop monitor loop

pub mod app;
pub mod config;
pub mod error;
pub mod replay;

pub use app::{Application, ReplaySummary};
pub use config::{AppConfig, ExitMode, PaperConfig};
pub use error::{AppError, AppResult};
pub use replay::{parse_line, ReplayCommand, ReplayLine};
