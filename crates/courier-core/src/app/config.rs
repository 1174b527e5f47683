//! Dispatch settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound for every duration knob: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Knobs of the dispatch loop. All durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Timer period between ticks.
    pub tick_interval_secs: u64,

    /// Maximum claims per tick.
    pub batch_limit: usize,

    /// Upper bound on one send; 0 means unbounded.
    pub send_timeout_secs: u64,

    /// Age after which a `processing` claim counts as stale. Only used by the
    /// explicit recovery operation.
    pub stale_after_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            batch_limit: 50,
            send_timeout_secs: 120,
            stale_after_secs: 900,
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = number(&lookup, "COURIER_TICK_INTERVAL_SECS")? {
            config.tick_interval_secs = v;
        }
        if let Some(v) = number(&lookup, "COURIER_BATCH_LIMIT")? {
            config.batch_limit = v as usize;
        }
        if let Some(v) = number(&lookup, "COURIER_SEND_TIMEOUT_SECS")? {
            config.send_timeout_secs = v;
        }
        if let Some(v) = number(&lookup, "COURIER_STALE_AFTER_SECS")? {
            config.stale_after_secs = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Zero {
                key: "tick_interval_secs",
            });
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::Zero { key: "batch_limit" });
        }
        if self.stale_after_secs == 0 {
            return Err(ConfigError::Zero {
                key: "stale_after_secs",
            });
        }
        // 大きすぎる値は Instant / DateTime の演算で overflow する
        check_max("tick_interval_secs", self.tick_interval_secs)?;
        check_max("send_timeout_secs", self.send_timeout_secs)?;
        check_max("stale_after_secs", self.stale_after_secs)?;
        Ok(())
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_secs > 0).then(|| Duration::from_secs(self.send_timeout_secs))
    }

    /// Fails instead of wrapping when the config skipped `validate`.
    pub fn stale_after(&self) -> Result<chrono::Duration, ConfigError> {
        let too_large = ConfigError::TooLarge {
            key: "stale_after_secs",
            max: MAX_DURATION_SECS,
            value: self.stale_after_secs,
        };
        let Ok(secs) = i64::try_from(self.stale_after_secs) else {
            return Err(too_large);
        };
        chrono::Duration::try_seconds(secs).ok_or(too_large)
    }
}

pub(crate) fn check_max(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value > MAX_DURATION_SECS {
        return Err(ConfigError::TooLarge {
            key,
            max: MAX_DURATION_SECS,
            value,
        });
    }
    Ok(())
}

fn number(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::NotANumber {
            key: key.to_string(),
            value: raw,
        })
}
