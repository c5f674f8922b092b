// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection watchdog.
//!
//! Monitors two health signals while a connection is up:
//!
//! - **Idle timeout**: no frame delivered within the window.
//! - **Error threshold**: more than `max_exceptions` protocol errors since
//!   activation.
//!
//! The I/O loop calls [`Watchdog::check`] on every tick (far more often
//! than once per window) and tears the connection down when it trips.
//! Frame arrival resets the idle clock; errors do not.

use std::fmt;
use std::time::{Duration, Instant};

/// Why the watchdog asked for the connection to be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTrip {
    /// No data within the idle window; carries the observed gap.
    Idle(Duration),

    /// The error count exceeded the configured maximum.
    TooManyErrors(u32),
}

impl fmt::Display for WatchdogTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle(gap) => write!(f, "no data received in {:.1}s", gap.as_secs_f64()),
            Self::TooManyErrors(count) => write!(f, "exception threshold exceeded: {count}"),
        }
    }
}

/// Idle/error watchdog for one connection.
#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    max_exceptions: u32,
    last_data: Instant,
    exceptions: u32,
    active: bool,
}

impl Watchdog {
    /// Create a watchdog with the given thresholds.
    pub fn new(timeout: Duration, max_exceptions: u32) -> Self {
        Self {
            timeout,
            max_exceptions,
            last_data: Instant::now(),
            exceptions: 0,
            active: false,
        }
    }

    /// Arm the watchdog: the idle clock starts at `now`, errors reset.
    pub fn activate(&mut self, now: Instant) {
        self.active = true;
        self.last_data = now;
        self.exceptions = 0;
        log::debug!("[WATCHDOG] Armed");
    }

    /// Disarm (on disconnect).
    pub fn deactivate(&mut self) {
        self.active = false;
        log::debug!("[WATCHDOG] Disarmed");
    }

    /// Whether the watchdog is armed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reset the idle clock; called when a frame reaches the supervisor.
    pub fn on_data_received(&mut self, now: Instant) {
        self.last_data = now;
    }

    /// Count one protocol error. Errors never reset the idle clock.
    pub fn on_exception(&mut self) -> u32 {
        self.exceptions += 1;
        log::debug!("[WATCHDOG] Exception count: {}", self.exceptions);
        self.exceptions
    }

    /// Errors counted since activation.
    pub fn exception_count(&self) -> u32 {
        self.exceptions
    }

    /// Evaluate both thresholds at `now`.
    pub fn check(&self, now: Instant) -> Option<WatchdogTrip> {
        if !self.active {
            return None;
        }

        let gap = now.duration_since(self.last_data);
        if gap > self.timeout {
            return Some(WatchdogTrip::Idle(gap));
        }

        if self.exceptions > self.max_exceptions {
            return Some(WatchdogTrip::TooManyErrors(self.exceptions));
        }

        None
    }
}

// ============================================================================
// Tests
// ============================================================================
