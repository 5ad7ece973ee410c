//! Environment-backed runtime configuration.

use std::{env, error::Error, fmt};

use chat_core::{DEFAULT_RECONCILE_WINDOW_MS, PreviewLabels};

const DEFAULT_PAGE_SIZE: u16 = 20;
const MAX_PAGE_SIZE: u16 = 100;
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_COMMAND_BUFFER: usize = 128;
const DEFAULT_EVENT_BUFFER: usize = 512;

/// Runtime tuning for the chat core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Messages requested per history page.
    pub page_size: u16,
    /// Max timestamp distance for matching an echo to an optimistic entry.
    pub reconcile_window_ms: u64,
    /// How long an unacknowledged send stays pending before it fails.
    pub pending_timeout_ms: u64,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Room-list placeholders for media messages.
    pub preview_labels: PreviewLabels,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reconcile_window_ms: DEFAULT_RECONCILE_WINDOW_MS,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            preview_labels: PreviewLabels::default(),
        }
    }
}

impl ChatConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let page_size = parse_positive::<u16, _>(
            "VENTURECHAT_PAGE_SIZE",
            DEFAULT_PAGE_SIZE,
            &mut lookup,
        )?
        .min(MAX_PAGE_SIZE);
        let reconcile_window_ms = parse_positive(
            "VENTURECHAT_RECONCILE_WINDOW_MS",
            DEFAULT_RECONCILE_WINDOW_MS,
            &mut lookup,
        )?;
        let pending_timeout_ms = parse_positive(
            "VENTURECHAT_PENDING_TIMEOUT_MS",
            DEFAULT_PENDING_TIMEOUT_MS,
            &mut lookup,
        )?;
        let command_buffer = parse_positive(
            "VENTURECHAT_COMMAND_BUFFER",
            DEFAULT_COMMAND_BUFFER,
            &mut lookup,
        )?;
        let event_buffer =
            parse_positive("VENTURECHAT_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        Ok(Self {
            page_size,
            reconcile_window_ms,
            pending_timeout_ms,
            command_buffer,
            event_buffer,
            preview_labels: PreviewLabels::default(),
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_positive<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(raw) = lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };

    let value = raw
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: err.to_string(),
        })?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw,
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ChatConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        ChatConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).expect("defaults should parse");
        assert_eq!(config, ChatConfig::default());
        assert_eq!(config.reconcile_window_ms, 5_000);
    }

    #[test]
    fn reads_overrides_and_clamps_page_size() {
        let config = config_from(&[
            ("VENTURECHAT_PAGE_SIZE", "500"),
            ("VENTURECHAT_RECONCILE_WINDOW_MS", " 8000 "),
            ("VENTURECHAT_PENDING_TIMEOUT_MS", "2500"),
        ])
        .expect("overrides should parse");
        assert_eq!(config.page_size, 100);
        assert_eq!(config.reconcile_window_ms, 8_000);
        assert_eq!(config.pending_timeout_ms, 2_500);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("VENTURECHAT_EVENT_BUFFER", "   ")]).expect("blank is unset");
        assert_eq!(config.event_buffer, 512);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let err = config_from(&[("VENTURECHAT_PAGE_SIZE", "0")]).expect_err("zero page size");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "VENTURECHAT_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
        );

        let err = config_from(&[("VENTURECHAT_PENDING_TIMEOUT_MS", "soon")])
            .expect_err("non-numeric timeout");
        assert!(err.to_string().starts_with("invalid VENTURECHAT_PENDING_TIMEOUT_MS='soon'"));
    }
}
