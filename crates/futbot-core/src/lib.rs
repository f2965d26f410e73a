//! Core domain types for the futbot exit subsystem.
//!
//! This crate provides fundamental types used throughout the bot:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `Position`: The tracked futures position with its stop-loss and TP ladder
//! - `SharedPosition`: Lock-guarded handle shared by every exit path
//! - `ExitAction`, `ExitType`: Exit request and exit classification enums
//! - `Clock`: Injected, drift-corrected time source

pub mod action;
pub mod clock;
pub mod decimal;
pub mod error;
pub mod position;

pub use action::{ExitAction, ExitType};
pub use clock::{Clock, ClockService, ManualClock};
pub use decimal::{parse_wire_decimal, Price, Size};
pub use error::{CoreError, Result};
pub use position::{
    Position, PositionSide, PositionStatus, SharedPosition, StopLoss, TakeProfit,
};
