// =============================================================================
// Reconnect backoff
// =============================================================================
//
//   delay(attempt) = min(base_delay * 2^attempt, cap_delay)
//
// `attempt` starts at zero, is incremented after every scheduled retry and is
// reset by a successful connect. Once `max_attempts` retries have been handed
// out, `next_delay` returns `None` and the caller stops.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_cap_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

/// Reconnect tuning, supplied at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,

    /// Consecutive failed reconnects tolerated before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Capped exponential backoff state for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Retries handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next reconnect, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        let delay = Self::delay_for(&self.config, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    fn delay_for(config: &ReconnectConfig, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = config
            .base_delay_ms
            .saturating_mul(factor)
            .min(config.cap_delay_ms);
        Duration::from_millis(ms)
    }
}
