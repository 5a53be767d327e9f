//! Reconnect backoff policy

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::config::ReconnectConfig;

/// Bounded exponential backoff.
///
/// The delay before reconnect number `n` (1-based) is
/// `min(max_delay_ms, base_delay_ms * 2^(n-1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay_ms,
            config.max_delay_ms,
        )
    }

    /// Reconnects scheduled since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay used when the counter currently reads `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        2u64.checked_pow(attempt)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms)
    }

    /// Delay the next scheduled reconnect would use
    pub fn next_delay(&self) -> Duration {
        Duration::from_millis(self.delay_for_attempt(self.attempt))
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Consume one attempt, returning its delay in milliseconds.
    ///
    /// Returns `None` once the attempts are exhausted.
    pub fn record_attempt(&mut self) -> Option<u64> {
        if !self.can_retry() {
            return None;
        }
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Called on every successful open and on explicit connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
