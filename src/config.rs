//! Runtime configuration.
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. Builder methods ([`RuntimeBuilder::default_workers`], [`RuntimeBuilder::time_mode`])
//! 2. Environment variables, when [`RuntimeBuilder::from_env`] is used
//! 3. [`RuntimeConfig::default`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COTASK_DEFAULT_WORKERS` | `usize` (>= 1) | `default_workers` |
//! | `COTASK_TIME_MODE` | `virtual` \| `paced` | `time_mode` |
//!
//! [`RuntimeBuilder::default_workers`]: crate::RuntimeBuilder::default_workers
//! [`RuntimeBuilder::time_mode`]: crate::RuntimeBuilder::time_mode
//! [`RuntimeBuilder::from_env`]: crate::RuntimeBuilder::from_env

use std::str::FromStr;

/// Environment variable for the default pool's worker count.
pub const ENV_DEFAULT_WORKERS: &str = "COTASK_DEFAULT_WORKERS";
/// Environment variable for the time mode.
pub const ENV_TIME_MODE: &str = "COTASK_TIME_MODE";

/// How the driving loop treats gaps in virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeMode {
    /// Jump straight to the next deadline.
    #[default]
    Virtual,
    /// Sleep the calling thread for the real length of each gap before jumping.
    Paced,
}

impl FromStr for TimeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtual" => Ok(TimeMode::Virtual),
            "paced" | "real" => Ok(TimeMode::Paced),
            other => Err(ConfigError::InvalidValue {
                var: ENV_TIME_MODE,
                value: other.to_string(),
                expected: "virtual or paced",
            }),
        }
    }
}

/// Invalid configuration input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Settings of a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Logical worker slots in the default pool, polled per scheduling round.
    pub default_workers: usize,
    /// Virtual or paced time.
    pub time_mode: TimeMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_workers: 4,
            time_mode: TimeMode::Virtual,
        }
    }
}

impl RuntimeConfig {
    /// Clamps values into their valid ranges.
    pub fn normalize(&mut self) {
        self.default_workers = self.default_workers.max(1);
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value if set.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_DEFAULT_WORKERS) {
            self.default_workers = parse_workers(&val)?;
        }
        if let Some(val) = lookup(ENV_TIME_MODE) {
            self.time_mode = val.parse()?;
        }
        Ok(())
    }
}

fn parse_workers(val: &str) -> Result<usize, ConfigError> {
    match val.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            var: ENV_DEFAULT_WORKERS,
            value: val.to_string(),
            expected: "an integer >= 1",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();

        assert_eq!(config.default_workers, 4);
        assert_eq!(config.time_mode, TimeMode::Virtual);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup(&[
                (ENV_DEFAULT_WORKERS, " 2 "),
                (ENV_TIME_MODE, "Paced"),
            ]))
            .unwrap();

        assert_eq!(config.default_workers, 2);
        assert_eq!(config.time_mode, TimeMode::Paced);
    }

    #[test]
    fn test_unset_variables_keep_values() {
        let mut config = RuntimeConfig {
            default_workers: 7,
            time_mode: TimeMode::Paced,
        };
        config.apply_overrides(lookup(&[])).unwrap();

        assert_eq!(config.default_workers, 7);
        assert_eq!(config.time_mode, TimeMode::Paced);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        let mut config = RuntimeConfig::default();

        let err = config
            .apply_overrides(lookup(&[(ENV_DEFAULT_WORKERS, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DEFAULT_WORKERS));

        let err = config
            .apply_overrides(lookup(&[(ENV_TIME_MODE, "warp")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: ENV_TIME_MODE, .. }));
    }

    #[test]
    fn test_normalize_clamps_workers() {
        let mut config = RuntimeConfig {
            default_workers: 0,
            ..RuntimeConfig::default()
        };
        config.normalize();

        assert_eq!(config.default_workers, 1);
    }
}
