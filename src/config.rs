//! Verifier configuration.
//!
//! The relying party identifies itself with its App ID (`<TEAM_ID>.<BUNDLE_ID>`)
//! and the App Attest environment the client was built against. Both can be
//! supplied directly or read from the process environment.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_ATTEST_DEVELOP: &[u8; 16] = b"appattestdevelop";
const APP_ATTEST: &[u8; 16] = b"appattest\0\0\0\0\0\0\0";

const ENV_APP_ID: &str = "APPATTEST_APP_ID";
const ENV_ENVIRONMENT: &str = "APPATTEST_ENVIRONMENT";
const ENV_COUNTER_POLICY: &str = "APPATTEST_COUNTER_POLICY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("unknown environment {0:?}, expected \"development\" or \"production\"")]
    UnknownEnvironment(String),

    #[error("unknown counter policy {0:?}, expected \"non-decreasing\" or \"strictly-increasing\"")]
    UnknownCounterPolicy(String),
}

/// App Attest environment, selecting the AAGUID the authenticator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    /// The 16-byte AAGUID expected in attestation authenticator data.
    pub const fn aaguid(self) -> &'static [u8; 16] {
        match self {
            Environment::Development => APP_ATTEST_DEVELOP,
            Environment::Production => APP_ATTEST,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            _ => Err(ConfigError::UnknownEnvironment(s.to_string())),
        }
    }
}

/// How the assertion counter must relate to the last stored counter.
///
/// Devices increment the counter on every assertion, so `StrictlyIncreasing`
/// also rejects a replay of the most recent assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CounterPolicy {
    /// `sign_count >= previous_count`
    #[default]
    NonDecreasing,
    /// `sign_count > previous_count`
    StrictlyIncreasing,
}

impl CounterPolicy {
    pub fn accepts(self, sign_count: u32, previous_count: u32) -> bool {
        match self {
            CounterPolicy::NonDecreasing => sign_count >= previous_count,
            CounterPolicy::StrictlyIncreasing => sign_count > previous_count,
        }
    }
}

impl FromStr for CounterPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "non-decreasing" => Ok(CounterPolicy::NonDecreasing),
            "strictly-increasing" => Ok(CounterPolicy::StrictlyIncreasing),
            _ => Err(ConfigError::UnknownCounterPolicy(s.to_string())),
        }
    }
}

/// Relying party settings shared by the attestation and assertion verifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAttestConfig {
    pub app_id: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub counter_policy: CounterPolicy,
}

impl AppAttestConfig {
    pub fn new(app_id: impl Into<String>, environment: Environment) -> Self {
        Self {
            app_id: app_id.into(),
            environment,
            counter_policy: CounterPolicy::default(),
        }
    }

    pub fn with_counter_policy(mut self, counter_policy: CounterPolicy) -> Self {
        self.counter_policy = counter_policy;
        self
    }

    /// Reads `APPATTEST_APP_ID`, `APPATTEST_ENVIRONMENT` (default `production`)
    /// and `APPATTEST_COUNTER_POLICY` (default `non-decreasing`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let app_id = lookup(ENV_APP_ID)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_APP_ID))?;

        let environment = lookup(ENV_ENVIRONMENT)
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let counter_policy = lookup(ENV_COUNTER_POLICY)
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            app_id,
            environment,
            counter_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn aaguids_are_sixteen_bytes() {
        assert_eq!(Environment::Development.aaguid(), b"appattestdevelop");
        assert_eq!(
            Environment::Production.aaguid(),
            &[b'a', b'p', b'p', b'a', b't', b't', b'e', b's', b't', 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("Development".parse(), Ok(Environment::Development));
        assert_eq!(" production ".parse(), Ok(Environment::Production));
        assert_eq!(
            "staging".parse::<Environment>(),
            Err(ConfigError::UnknownEnvironment("staging".into()))
        );
    }

    #[test]
    fn counter_policies() {
        assert!(CounterPolicy::NonDecreasing.accepts(0, 0));
        assert!(CounterPolicy::NonDecreasing.accepts(11, 10));
        assert!(!CounterPolicy::NonDecreasing.accepts(9, 10));

        assert!(!CounterPolicy::StrictlyIncreasing.accepts(10, 10));
        assert!(CounterPolicy::StrictlyIncreasing.accepts(11, 10));
    }

    #[test]
    fn config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_APP_ID, "TEAMID.com.example.app"),
            (ENV_ENVIRONMENT, "development"),
            (ENV_COUNTER_POLICY, "strictly-increasing"),
        ]
        .into_iter()
        .collect();

        let config =
            AppAttestConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.app_id, "TEAMID.com.example.app");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.counter_policy, CounterPolicy::StrictlyIncreasing);
    }

    #[test]
    fn config_defaults_and_missing_app_id() {
        let config = AppAttestConfig::from_lookup(|k| {
            (k == ENV_APP_ID).then(|| "TEAMID.com.example.app".to_string())
        })
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.counter_policy, CounterPolicy::NonDecreasing);

        assert_eq!(
            AppAttestConfig::from_lookup(|_| None),
            Err(ConfigError::Missing(ENV_APP_ID))
        );
    }

    #[test]
    fn config_deserializes_from_json() {
        let config: AppAttestConfig = serde_json::from_str(
            r#"{"app_id": "TEAMID.com.example.app", "environment": "development"}"#,
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.counter_policy, CounterPolicy::NonDecreasing);
    }
}
