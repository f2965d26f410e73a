//! Injected time source.
//!
//! Exchange timestamps drift from local time; the correction lives in a
//! [`ClockService`] instance handed to every component that needs "now",
//! never in process-global state.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System clock corrected by an exchange-derived offset.
#[derive(Debug, Default)]
pub struct ClockService {
    offset_ms: AtomicI64,
}

impl ClockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current drift correction in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Recompute the offset from a server time sample.
    ///
    /// Returns the new offset.
    pub fn sync_with_server_time(&self, server_time_ms: i64) -> i64 {
        let offset = server_time_ms - Utc::now().timestamp_millis();
        self.set_offset_ms(offset);
        offset
    }
}

impl Clock for ClockService {
    fn now_ms(&self) -> u64 {
        let corrected = Utc::now().timestamp_millis() + self.offset_ms();
        u64::try_from(corrected).unwrap_or(0)
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}
