//! Tracker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Timing and retry knobs for a [`TrackingSession`](crate::TrackingSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Reconnects attempted before demoting to polling.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles per attempt.
    pub base_reconnect_delay_ms: u64,
    /// Upper bound on a single reconnect delay.
    pub max_reconnect_delay_ms: u64,
    /// Interval between status queries while polling.
    pub poll_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 16_000,
            poll_interval_ms: 3_000,
        }
    }
}

impl TrackerConfig {
    /// Defaults overridden by `JOB_SYNC_*` environment variables.
    ///
    /// Unparseable values are reported rather than ignored.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_number("JOB_SYNC_MAX_RECONNECT_ATTEMPTS")? {
            config.max_reconnect_attempts = u32::try_from(v).map_err(|_| {
                SyncError::Configuration("JOB_SYNC_MAX_RECONNECT_ATTEMPTS out of range".into())
            })?;
        }
        if let Some(v) = env_number("JOB_SYNC_BASE_RECONNECT_DELAY_MS")? {
            config.base_reconnect_delay_ms = v;
        }
        if let Some(v) = env_number("JOB_SYNC_MAX_RECONNECT_DELAY_MS")? {
            config.max_reconnect_delay_ms = v;
        }
        if let Some(v) = env_number("JOB_SYNC_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(SyncError::Configuration(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.base_reconnect_delay_ms == 0 {
            return Err(SyncError::Configuration(
                "base_reconnect_delay_ms must be greater than zero".into(),
            ));
        }
        if self.max_reconnect_delay_ms < self.base_reconnect_delay_ms {
            return Err(SyncError::Configuration(format!(
                "max_reconnect_delay_ms ({}) is below base_reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.base_reconnect_delay_ms
            )));
        }
        Ok(())
    }

    pub fn base_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_number(key: &str) -> SyncResult<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Configuration(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
