//! Poller configuration.

use std::time::Duration;

use crate::protocol::config::StartMode;
use crate::retry::RetryPolicy;

/// Timing and behaviour knobs for [`Poller`](crate::Poller).
///
/// Durations are whole milliseconds so the struct deserializes from flat
/// JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PollerConfig {
    /// Poll cadence while awaiting the beep and while polling.
    pub tick_ms: u64,
    /// Minimum gap between shot-count reads while polling.
    pub count_cooldown_ms: u64,
    /// Deadline for each request.
    pub request_timeout_ms: u64,
    /// Attempts and backoff for each shot-time fetch.
    pub retry: RetryPolicy,
    pub start_mode: StartMode,
    /// Send standby/ready to the timer on reset.
    pub reset_device_on_reset: bool,
}

impl PollerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn count_cooldown(&self) -> Duration {
        Duration::from_millis(self.count_cooldown_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[cfg(feature = "json")]
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 200,
            count_cooldown_ms: 400,
            request_timeout_ms: 1000,
            retry: RetryPolicy::default(),
            start_mode: StartMode::default(),
            reset_device_on_reset: true,
        }
    }
}
