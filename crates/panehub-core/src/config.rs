//! Orchestrator tuning knobs.
//!
//! Every field has a default and can be overridden by a string setting
//! (the daemon reads them from its settings table). Unknown keys and
//! unparsable values are rejected by [`OrchestratorConfig::apply_setting`];
//! [`OrchestratorConfig::apply_settings`] logs and skips them.

use std::str::FromStr;
use std::time::Duration;

use panehub_pty::buffer::{DEFAULT_SCROLLBACK_BYTES, DEFAULT_SCROLLBACK_LINES};
use panehub_pty::stream::DEFAULT_SUBSCRIBER_QUEUE;
use panehub_pty::{ScrollbackLimits, StreamConfig};
use serde::{Deserialize, Serialize};

use crate::status::StatusExpiry;

/// Setting keys understood by [`OrchestratorConfig::apply_setting`].
pub const SETTING_KEYS: &[&str] = &[
    "scrollback_lines",
    "scrollback_bytes",
    "subscriber_queue",
    "input_queue",
    "close_grace_ms",
    "resize_debounce_ms",
    "metrics_interval_ms",
    "metrics_history",
    "status_expiry_ms",
    "status_markers",
    "default_shell",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scrollback_lines: usize,
    pub scrollback_bytes: usize,
    pub subscriber_queue: usize,
    pub input_queue: usize,
    pub close_grace_ms: u64,
    pub resize_debounce_ms: u64,
    pub metrics_interval_ms: u64,
    pub metrics_history: usize,
    /// `None` keeps `running` statuses until overwritten.
    pub status_expiry_ms: Option<u64>,
    pub status_markers: bool,
    /// Overrides `$SHELL` for terminals created without an explicit shell.
    pub default_shell: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            input_queue: 256,
            close_grace_ms: 2_000,
            resize_debounce_ms: 100,
            metrics_interval_ms: 2_000,
            metrics_history: 60,
            status_expiry_ms: None,
            status_markers: true,
            default_shell: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.max(1))
    }

    pub fn status_expiry(&self) -> StatusExpiry {
        match self.status_expiry_ms {
            Some(ms) if ms > 0 => StatusExpiry::After(Duration::from_millis(ms)),
            _ => StatusExpiry::Never,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            scrollback: ScrollbackLimits {
                max_lines: self.scrollback_lines,
                max_bytes: self.scrollback_bytes,
            },
            subscriber_queue: self.subscriber_queue,
            input_queue: self.input_queue,
        }
    }

    /// Apply one string-valued override.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "scrollback_lines" => self.scrollback_lines = parse_positive(value).ok_or_else(invalid)?,
            "scrollback_bytes" => self.scrollback_bytes = parse_positive(value).ok_or_else(invalid)?,
            "subscriber_queue" => self.subscriber_queue = parse_positive(value).ok_or_else(invalid)?,
            "input_queue" => self.input_queue = parse_positive(value).ok_or_else(invalid)?,
            "close_grace_ms" => self.close_grace_ms = value.parse().map_err(|_| invalid())?,
            "resize_debounce_ms" => self.resize_debounce_ms = value.parse().map_err(|_| invalid())?,
            "metrics_interval_ms" => self.metrics_interval_ms = parse_positive(value).ok_or_else(invalid)?,
            "metrics_history" => self.metrics_history = parse_positive(value).ok_or_else(invalid)?,
            "status_expiry_ms" => {
                self.status_expiry_ms = match value {
                    "" | "never" | "0" => None,
                    ms => Some(ms.parse().map_err(|_| invalid())?),
                }
            }
            "status_markers" => self.status_markers = value.parse().map_err(|_| invalid())?,
            "default_shell" => {
                self.default_shell = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Apply many overrides, logging and skipping the ones that do not apply.
    pub fn apply_settings<'a, I>(&mut self, settings: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in settings {
            if let Err(e) = self.apply_setting(key, value) {
                log::warn!("[config] ignoring setting: {e}");
            }
        }
    }

    /// Current values as settings rows, keyed like [`SETTING_KEYS`].
    pub fn to_settings(&self) -> Vec<(String, String)> {
        let expiry = self.status_expiry_ms.map(|ms| ms.to_string()).unwrap_or_else(|| "never".to_string());
        vec![
            ("scrollback_lines".into(), self.scrollback_lines.to_string()),
            ("scrollback_bytes".into(), self.scrollback_bytes.to_string()),
            ("subscriber_queue".into(), self.subscriber_queue.to_string()),
            ("input_queue".into(), self.input_queue.to_string()),
            ("close_grace_ms".into(), self.close_grace_ms.to_string()),
            ("resize_debounce_ms".into(), self.resize_debounce_ms.to_string()),
            ("metrics_interval_ms".into(), self.metrics_interval_ms.to_string()),
            ("metrics_history".into(), self.metrics_history.to_string()),
            ("status_expiry_ms".into(), expiry),
            ("status_markers".into(), self.status_markers.to_string()),
            ("default_shell".into(), self.default_shell.clone().unwrap_or_default()),
        ]
    }
}

fn parse_positive<T: FromStr + PartialOrd + Default>(value: &str) -> Option<T> {
    value.parse::<T>().ok().filter(|v| *v > T::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.scrollback_lines, 10_000);
        assert_eq!(config.scrollback_bytes, 8 * 1024 * 1024);
        assert_eq!(config.subscriber_queue, 1024);
        assert_eq!(config.close_grace(), Duration::from_secs(2));
        assert_eq!(config.resize_debounce(), Duration::from_millis(100));
        assert_eq!(config.metrics_interval(), Duration::from_secs(2));
        assert_eq!(config.metrics_history, 60);
        assert_eq!(config.status_expiry(), StatusExpiry::Never);
        assert!(config.status_markers);
    }

    #[test]
    fn apply_setting_parses_values() {
        let mut config = OrchestratorConfig::default();
        config.apply_setting("scrollback_lines", "500").unwrap();
        config.apply_setting("close_grace_ms", " 250 ").unwrap();
        config.apply_setting("status_expiry_ms", "3000").unwrap();
        config.apply_setting("status_markers", "false").unwrap();
        config.apply_setting("default_shell", "/bin/sh").unwrap();

        assert_eq!(config.scrollback_lines, 500);
        assert_eq!(config.close_grace(), Duration::from_millis(250));
        assert_eq!(config.status_expiry(), StatusExpiry::After(Duration::from_secs(3)));
        assert!(!config.status_markers);
        assert_eq!(config.default_shell.as_deref(), Some("/bin/sh"));

        config.apply_setting("status_expiry_ms", "never").unwrap();
        assert_eq!(config.status_expiry(), StatusExpiry::Never);
    }

    #[test]
    fn metrics_interval_accepts_positive_millis() {
        let mut config = OrchestratorConfig::default();
        config.apply_setting("metrics_interval_ms", "500").unwrap();
        assert_eq!(config.metrics_interval(), Duration::from_millis(500));
        assert!(config.apply_setting("metrics_interval_ms", "0").is_err());
        assert!(config.apply_setting("metrics_interval_ms", "-5").is_err());
        assert_eq!(config.metrics_interval_ms, 500);
    }

    #[test]
    fn apply_setting_rejects_bad_input() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(
            config.apply_setting("nope", "1"),
            Err(ConfigError::UnknownKey("nope".into()))
        );
        assert!(config.apply_setting("scrollback_lines", "0").is_err());
        assert!(config.apply_setting("metrics_history", "lots").is_err());
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn apply_settings_skips_invalid_entries() {
        let mut config = OrchestratorConfig::default();
        config.apply_settings([("subscriber_queue", "8"), ("bogus", "1"), ("input_queue", "x")]);
        assert_eq!(config.subscriber_queue, 8);
        assert_eq!(config.input_queue, 256);
    }

    #[test]
    fn settings_round_trip_through_strings() {
        let mut source = OrchestratorConfig::default();
        source.metrics_history = 5;
        source.status_expiry_ms = Some(100);

        let mut restored = OrchestratorConfig::default();
        for (key, value) in source.to_settings() {
            restored.apply_setting(&key, &value).unwrap();
        }
        assert_eq!(restored, source);
        assert_eq!(source.to_settings().len(), SETTING_KEYS.len());
    }
}
