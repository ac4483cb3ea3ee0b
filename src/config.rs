// src/config.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::LedgerError;

/// Ledger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Max wait for a single row lock (milliseconds)
    pub lock_timeout_ms: u64,

    /// Bound on a whole atomic unit, locks included (milliseconds)
    pub operation_timeout_ms: u64,

    /// Reject mutations that carry no external reference
    pub require_reference: bool,

    /// Audit actor used when a request names none
    pub default_actor: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            operation_timeout_ms: 10_000,
            require_reference: false,
            default_actor: "system".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Defaults overlaid with `LEDGER_*` environment variables.
    pub fn from_env() -> Result<Self, LedgerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LedgerError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("LEDGER_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse_var("LEDGER_LOCK_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("LEDGER_OPERATION_TIMEOUT_MS") {
            config.operation_timeout_ms = parse_var("LEDGER_OPERATION_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("LEDGER_REQUIRE_REFERENCE") {
            config.require_reference = parse_var("LEDGER_REQUIRE_REFERENCE", &raw)?;
        }
        if let Some(actor) = lookup("LEDGER_DEFAULT_ACTOR") {
            config.default_actor = actor;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.lock_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(LedgerError::Config("timeouts must be non-zero".to_string()));
        }
        if self.default_actor.is_empty() {
            return Err(LedgerError::Config("default_actor must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, LedgerError> {
    raw.trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("{name}: cannot parse {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overlay() {
        let vars = HashMap::from([
            ("LEDGER_LOCK_TIMEOUT_MS", "250"),
            ("LEDGER_REQUIRE_REFERENCE", "true"),
        ]);
        let config =
            LedgerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.operation_timeout_ms, 10_000);
        assert!(config.require_reference);
        assert_eq!(config.default_actor, "system");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = LedgerConfig::from_lookup(|name| {
            (name == "LEDGER_OPERATION_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_invalid() {
        let config = LedgerConfig {
            lock_timeout_ms: 0,
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{ "require_reference": true }"#).unwrap();
        assert!(config.require_reference);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }
}
