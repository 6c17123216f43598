//! HTTP transport configuration.

use std::time::Duration;

/// Transport-level knobs, loadable from `TIDEPOOL_*` environment
/// variables.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Permissive CORS for browser clients.
    pub enable_cors: bool,
    /// How long a finished generation stays replayable on reconnect.
    pub resume_window_secs: u64,
    /// Buffer size of the per-request event channels.
    pub event_buffer: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable_cors: false,
            resume_window_secs: 15,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        variable: &'static str,
        value: String,
        reason: String,
    },
}

impl HttpConfig {
    pub fn resume_window(&self) -> Duration {
        Duration::from_secs(self.resume_window_secs)
    }

    /// Load overrides from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TIDEPOOL_ENABLE_CORS") {
            config.enable_cors = parse_var("TIDEPOOL_ENABLE_CORS", &value)?;
        }
        if let Ok(value) = std::env::var("TIDEPOOL_RESUME_WINDOW_SECS") {
            config.resume_window_secs = parse_var("TIDEPOOL_RESUME_WINDOW_SECS", &value)?;
        }
        if let Ok(value) = std::env::var("TIDEPOOL_EVENT_BUFFER") {
            config.event_buffer = parse_var("TIDEPOOL_EVENT_BUFFER", &value)?;
            if config.event_buffer == 0 {
                return Err(ConfigError::InvalidValue {
                    variable: "TIDEPOOL_EVENT_BUFFER",
                    value,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    variable: &'static str,
    value: &str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        variable,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = HttpConfig::default();
        assert!(!config.enable_cors);
        assert_eq!(config.resume_window(), Duration::from_secs(15));
        assert!(config.event_buffer > 0);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        let result: Result<u64, _> = parse_var("TIDEPOOL_RESUME_WINDOW_SECS", "soon");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
