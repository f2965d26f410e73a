//! Integration tests for futbot-bot.
//!
//! These tests drive the paper application end to end:
//! - Configuration loading
//! - Replay through the paper venue
//! - Exit paths per exit mode

pub mod common;
