//! Engine configuration.
//!
//! All durations are milliseconds. Defaults match the behaviour users know
//! from the browser panels; `from_env` overlays `DOCSYNC_*` variables.

use serde::{Deserialize, Serialize};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Idle time after the last note edit before the note is flushed.
    pub note_idle_ms: u64,
    /// Idle time after the last task edit before the list is flushed.
    pub task_idle_ms: u64,
    /// Delay before an edit is announced to other tabs.
    pub broadcast_delay_ms: u64,
    /// Delay before a failed remote operation is retried.
    pub retry_delay_ms: u64,
    /// Local content older than this is re-fetched from the remote.
    pub staleness_window_ms: u64,
    /// Storage signals for the same key closer than this are coalesced.
    pub signal_dedupe_ms: u64,
    /// Prepended to every storage key.
    pub key_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            note_idle_ms: 15_000,
            task_idle_ms: 0,
            broadcast_delay_ms: 4_000,
            retry_delay_ms: 15_000,
            staleness_window_ms: 7 * DAY_MS,
            signal_dedupe_ms: 100,
            key_prefix: String::new(),
        }
    }
}

impl SyncConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Recognised variables:
    /// - `DOCSYNC_NOTE_IDLE_MS`, `DOCSYNC_TASK_IDLE_MS`, `DOCSYNC_BROADCAST_DELAY_MS`
    /// - `DOCSYNC_RETRY_DELAY_MS`, `DOCSYNC_STALENESS_WINDOW_MS`, `DOCSYNC_SIGNAL_DEDUPE_MS`
    /// - `DOCSYNC_KEY_PREFIX`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let millis = |name: &'static str, slot: &mut u64| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(name) {
                *slot = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { name, value: raw })?;
            }
            Ok(())
        };
        millis("DOCSYNC_NOTE_IDLE_MS", &mut config.note_idle_ms)?;
        millis("DOCSYNC_TASK_IDLE_MS", &mut config.task_idle_ms)?;
        millis("DOCSYNC_BROADCAST_DELAY_MS", &mut config.broadcast_delay_ms)?;
        millis("DOCSYNC_RETRY_DELAY_MS", &mut config.retry_delay_ms)?;
        millis("DOCSYNC_STALENESS_WINDOW_MS", &mut config.staleness_window_ms)?;
        millis("DOCSYNC_SIGNAL_DEDUPE_MS", &mut config.signal_dedupe_ms)?;
        if let Some(prefix) = lookup("DOCSYNC_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a whole number of milliseconds, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.note_idle_ms, 15_000);
        assert_eq!(config.task_idle_ms, 0);
        assert_eq!(config.staleness_window_ms, 604_800_000);
    }

    #[test]
    fn test_lookup_overlays_defaults() {
        let vars: HashMap<&str, &str> =
            [("DOCSYNC_NOTE_IDLE_MS", " 500 "), ("DOCSYNC_KEY_PREFIX", "dev_")].into();
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.note_idle_ms, 500);
        assert_eq!(config.key_prefix, "dev_");
        assert_eq!(config.broadcast_delay_ms, 4_000);
    }

    #[test]
    fn test_invalid_number() {
        let err = SyncConfig::from_lookup(|k| (k == "DOCSYNC_RETRY_DELAY_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                name: "DOCSYNC_RETRY_DELAY_MS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"noteIdleMs": 1000}"#).unwrap();
        assert_eq!(config.note_idle_ms, 1000);
        assert_eq!(config.retry_delay_ms, 15_000);
    }
}
