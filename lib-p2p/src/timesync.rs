//! Clock freshness checks.
//!
//! The swarm rejects messages whose envelope timestamp is too far from local
//! time, and periodically verifies that the local clock itself has not
//! drifted. Both checks sit behind the [`TimeSync`] trait so deployments can
//! plug in an NTP-backed implementation and tests can force rejections.

use anyhow::{anyhow, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum tolerated difference between a message timestamp and local time.
pub const MAX_MESSAGE_DRIFT: Duration = Duration::from_secs(10 * 60);

/// Freshness oracle for message timestamps and the local clock.
pub trait TimeSync: Send + Sync {
    /// Is a message stamped `timestamp_ms` (unix milliseconds) fresh enough
    /// to process?
    fn check_message_drift(&self, timestamp_ms: i64) -> bool;

    /// Measure local clock drift. An error means the clock cannot be
    /// trusted and the node should shut down.
    fn check_system_clock_drift(&self) -> Result<Duration>;
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Default implementation judging freshness against the local system clock.
///
/// External clock sources (NTP queries, roughtime) are a deployment concern;
/// with only the local clock available, `check_system_clock_drift` reports
/// zero drift.
#[derive(Debug, Default)]
pub struct SystemTimeSync {
    max_drift: Option<Duration>,
}

impl SystemTimeSync {
    pub fn new() -> Self {
        Self { max_drift: None }
    }

    /// Override the tolerated message drift window.
    pub fn with_max_drift(max_drift: Duration) -> Self {
        Self {
            max_drift: Some(max_drift),
        }
    }

    fn window(&self) -> Duration {
        self.max_drift.unwrap_or(MAX_MESSAGE_DRIFT)
    }
}

impl TimeSync for SystemTimeSync {
    fn check_message_drift(&self, timestamp_ms: i64) -> bool {
        if timestamp_ms < 0 {
            return false;
        }
        let now = now_millis();
        let drift = now.abs_diff(timestamp_ms);
        drift <= self.window().as_millis() as u64
    }

    fn check_system_clock_drift(&self) -> Result<Duration> {
        // Sanity check only: a clock set before the epoch is unusable.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| anyhow!("system clock is before the unix epoch: {}", e))?;
        Ok(Duration::ZERO)
    }
}
