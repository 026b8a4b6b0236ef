use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::GovernanceError;

pub const ENV_PREFIX: &str = "TIERGATE_";

const MAX_RETRY_BOUND: u32 = 10;

/// Effective engine configuration after all layers are applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    pub coverage_floor: f64,
    pub concurrency_limit: usize,
    pub retry_bound: u32,
    pub timeout_ms: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            coverage_floor: 0.80,
            concurrency_limit: 4,
            retry_bound: 2,
            timeout_ms: 60_000,
        }
    }
}

/// Optional values from a single configuration layer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigOverrides {
    pub coverage_floor: Option<f64>,
    pub concurrency_limit: Option<usize>,
    pub retry_bound: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl GovernanceConfig {
    /// Reads a YAML or JSON config file. Missing keys take defaults.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when the file cannot be read,
    /// does not parse, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, GovernanceError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            GovernanceError::Configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|err| {
            GovernanceError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses `TIERGATE_*` variables from an environment snapshot.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] for values that do not parse.
    pub fn env_overrides(
        vars: &BTreeMap<String, String>,
    ) -> Result<ConfigOverrides, GovernanceError> {
        Ok(ConfigOverrides {
            coverage_floor: parse_env(vars, "COVERAGE_FLOOR")?,
            concurrency_limit: parse_env(vars, "CONCURRENCY_LIMIT")?,
            retry_bound: parse_env(vars, "RETRY_BOUND")?,
            timeout_ms: parse_env(vars, "TIMEOUT_MS")?,
        })
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(value) = overrides.coverage_floor {
            self.coverage_floor = value;
        }
        if let Some(value) = overrides.concurrency_limit {
            self.concurrency_limit = value;
        }
        if let Some(value) = overrides.retry_bound {
            self.retry_bound = value;
        }
        if let Some(value) = overrides.timeout_ms {
            self.timeout_ms = value;
        }
        self
    }

    /// Builds the effective configuration: defaults, then file, then
    /// environment, then flags.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] if any layer is invalid.
    pub fn layered(
        file: Option<&Path>,
        env: &BTreeMap<String, String>,
        flags: ConfigOverrides,
    ) -> Result<Self, GovernanceError> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base
            .with_overrides(Self::env_overrides(env)?)
            .with_overrides(flags);
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when a bound is violated.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if !(0.0..=1.0).contains(&self.coverage_floor) {
            return Err(GovernanceError::Configuration(format!(
                "coverage_floor MUST be within [0, 1], got {}",
                self.coverage_floor
            )));
        }
        if self.concurrency_limit == 0 {
            return Err(GovernanceError::Configuration(
                "concurrency_limit MUST be >= 1".to_string(),
            ));
        }
        if self.retry_bound > MAX_RETRY_BOUND {
            return Err(GovernanceError::Configuration(format!(
                "retry_bound MUST be <= {MAX_RETRY_BOUND}, got {}",
                self.retry_bound
            )));
        }
        if self.timeout_ms == 0 {
            return Err(GovernanceError::Configuration(
                "timeout_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(vars: &BTreeMap<String, String>, suffix: &str) -> Result<Option<T>, GovernanceError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    let Some(raw) = vars.get(&key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| GovernanceError::Configuration(format!("{key}={raw} is invalid: {err}")))
}
