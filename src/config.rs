use std::env;
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Process-level settings, read once at startup. Scoring policy is per
/// workspace and lives in the database instead.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub busy_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let log_filter = lookup("CARRYMARKD_LOG")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.log_filter);

        let busy_timeout = match lookup("CARRYMARKD_BUSY_TIMEOUT_MS") {
            Some(raw) => {
                let ms = raw
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidBusyTimeout(raw.clone()))?;
                if ms == 0 {
                    return Err(ConfigError::InvalidBusyTimeout(raw));
                }
                Duration::from_millis(ms)
            }
            None => defaults.busy_timeout,
        };

        Ok(Self {
            log_filter,
            busy_timeout,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CARRYMARKD_BUSY_TIMEOUT_MS must be a positive integer, got '{0}'")]
    InvalidBusyTimeout(String),
}
