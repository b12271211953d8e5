//! Environment configuration. Every setting has a default that is logged
//! when the variable is absent; malformed values are an error, not a panic.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::slang::openai::EnricherConfig;
use crate::stack::StackConfig;

pub const LOG_JSON_VAR: &str = "SLANGDECK_LOG_JSON";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    pub urban_base_url: String,
    pub enricher: EnricherConfig,
    pub stack: StackConfig,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Discovery sessions untouched this long are disposed.
    pub session_idle_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup (the process
    /// environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StackConfig::default();
        let stack = StackConfig {
            capacity: positive(&lookup, "SLANGDECK_STACK_CAPACITY", defaults.capacity)?,
            initial_batch: positive(&lookup, "SLANGDECK_INITIAL_BATCH", defaults.initial_batch)?,
            overshoot: try_load(&lookup, "SLANGDECK_FILL_OVERSHOOT", defaults.overshoot)?,
            max_fill_batch: positive(&lookup, "SLANGDECK_MAX_FILL_BATCH", defaults.max_fill_batch)?,
        };

        let enricher_defaults = EnricherConfig::default();
        let api_key = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!("OPENAI_API_KEY not set, every enrichment will fail");
        }
        let enricher = EnricherConfig {
            api_key,
            base_url: try_load(&lookup, "OPENAI_BASE_URL", enricher_defaults.base_url.clone())?,
            model: try_load(&lookup, "OPENAI_MODEL", enricher_defaults.model.clone())?,
            ..enricher_defaults
        };

        Ok(Self {
            port: try_load(&lookup, "SLANGDECK_PORT", 8080u16)?,
            db_path: PathBuf::from(try_load(
                &lookup,
                "SLANGDECK_DB_PATH",
                "slangdeck.db".to_string(),
            )?),
            urban_base_url: try_load(
                &lookup,
                "URBAN_DICTIONARY_BASE_URL",
                "https://api.urbandictionary.com".to_string(),
            )?,
            enricher,
            stack,
            cache_capacity: positive(&lookup, "SLANGDECK_CACHE_CAPACITY", 256)?,
            cache_ttl: Duration::from_secs(try_load(&lookup, "SLANGDECK_CACHE_TTL_SECS", 3600u64)?),
            session_idle_ttl: Duration::from_secs(
                positive(&lookup, "SLANGDECK_SESSION_IDLE_SECS", 1800)? as u64,
            ),
        })
    }
}

/// Read before the subscriber exists, so nothing is logged here.
pub fn log_json_enabled() -> bool {
    env::var(LOG_JSON_VAR)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn try_load<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }
        }),
    }
}

fn positive<F>(lookup: &F, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = try_load(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, PathBuf::from("slangdeck.db"));
        assert_eq!(config.stack, StackConfig::default());
        assert_eq!(config.cache_capacity, 256);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.session_idle_ttl, Duration::from_secs(1800));
        assert_eq!(config.enricher.model, "gpt-4o");
        assert!(config.enricher.api_key.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("SLANGDECK_PORT", "9000"),
            ("SLANGDECK_STACK_CAPACITY", "8"),
            ("SLANGDECK_FILL_OVERSHOOT", "0"),
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.stack.capacity, 8);
        assert_eq!(config.stack.overshoot, 0);
        assert_eq!(config.enricher.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.enricher.model, "gpt-4o-mini");
    }

    #[test]
    fn malformed_and_zero_values_are_rejected() {
        let err = load(&[("SLANGDECK_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLANGDECK_PORT", .. }));

        let err = load(&[("SLANGDECK_STACK_CAPACITY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLANGDECK_STACK_CAPACITY", .. }));
    }

    #[test]
    fn session_idle_ttl_is_configurable_but_never_zero() {
        let config = load(&[("SLANGDECK_SESSION_IDLE_SECS", "90")]).unwrap();
        assert_eq!(config.session_idle_ttl, Duration::from_secs(90));

        let err = load(&[("SLANGDECK_SESSION_IDLE_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLANGDECK_SESSION_IDLE_SECS", .. }));
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = load(&[("OPENAI_API_KEY", "  ")]).unwrap();
        assert!(config.enricher.api_key.is_none());
    }
}
