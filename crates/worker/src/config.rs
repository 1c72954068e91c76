//! Worker configuration loaded from environment variables.

use std::time::Duration;

use thiserror::Error;

use workflowq_observability::LogFormat;
use workflowq_queue::{DispatcherConfig, InterventionMarkers};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration.
///
/// | Env Var                          | Default                   |
/// |----------------------------------|---------------------------|
/// | `DATABASE_URL`                   | `sqlite://workflowq.db`   |
/// | `WORKFLOWQ_DB_MAX_CONNECTIONS`   | `4`                       |
/// | `WORKFLOWQ_POLL_INTERVAL_SECS`   | `30`                      |
/// | `WORKFLOWQ_MAX_CONCURRENT`       | `5`                       |
/// | `WORKFLOWQ_INTERVENTION_MARKERS` | `MFA,manual,intervention` |
/// | `WORKFLOWQ_SHUTDOWN_TIMEOUT_SECS`| `30`                      |
/// | `WORKFLOWQ_LOG_FORMAT`           | `json`                    |
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub intervention_markers: InterventionMarkers,
    /// How long shutdown waits for executing jobs.
    pub shutdown_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://workflowq.db".to_string(),
            db_max_connections: 4,
            poll_interval: Duration::from_secs(30),
            max_concurrent: 5,
            intervention_markers: InterventionMarkers::default(),
            shutdown_timeout: Duration::from_secs(30),
            log_format: LogFormat::Json,
        }
    }
}

fn parse<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl WorkerConfig {
    /// Load from the process environment. Call `dotenvy::dotenv()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables; unset variables take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.database_url);

        let db_max_connections = positive(
            "WORKFLOWQ_DB_MAX_CONNECTIONS",
            parse(
                "WORKFLOWQ_DB_MAX_CONNECTIONS",
                lookup("WORKFLOWQ_DB_MAX_CONNECTIONS"),
                u64::from(defaults.db_max_connections),
            )?,
        )?;
        let poll_secs = positive(
            "WORKFLOWQ_POLL_INTERVAL_SECS",
            parse(
                "WORKFLOWQ_POLL_INTERVAL_SECS",
                lookup("WORKFLOWQ_POLL_INTERVAL_SECS"),
                defaults.poll_interval.as_secs(),
            )?,
        )?;
        let max_concurrent = positive(
            "WORKFLOWQ_MAX_CONCURRENT",
            parse(
                "WORKFLOWQ_MAX_CONCURRENT",
                lookup("WORKFLOWQ_MAX_CONCURRENT"),
                defaults.max_concurrent as u64,
            )?,
        )?;
        let shutdown_secs = parse(
            "WORKFLOWQ_SHUTDOWN_TIMEOUT_SECS",
            lookup("WORKFLOWQ_SHUTDOWN_TIMEOUT_SECS"),
            defaults.shutdown_timeout.as_secs(),
        )?;
        let log_format = parse(
            "WORKFLOWQ_LOG_FORMAT",
            lookup("WORKFLOWQ_LOG_FORMAT"),
            defaults.log_format,
        )?;

        let intervention_markers = match lookup("WORKFLOWQ_INTERVENTION_MARKERS") {
            None => defaults.intervention_markers,
            Some(raw) => {
                let markers = InterventionMarkers::new(raw.split(',').map(str::trim));
                if markers.as_slice().is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "WORKFLOWQ_INTERVENTION_MARKERS",
                        value: raw,
                        reason: "at least one marker is required".to_string(),
                    });
                }
                markers
            }
        };

        Ok(Self {
            database_url,
            db_max_connections: u32::try_from(db_max_connections).map_err(|e| {
                ConfigError::Invalid {
                    key: "WORKFLOWQ_DB_MAX_CONNECTIONS",
                    value: db_max_connections.to_string(),
                    reason: e.to_string(),
                }
            })?,
            poll_interval: Duration::from_secs(poll_secs),
            max_concurrent: usize::try_from(max_concurrent).unwrap_or(usize::MAX),
            intervention_markers,
            shutdown_timeout: Duration::from_secs(shutdown_secs),
            log_format,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name("workflowq-worker")
            .with_poll_interval(self.poll_interval)
            .with_max_concurrent(self.max_concurrent)
            .with_intervention_markers(self.intervention_markers.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, WorkerConfig::default());

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.poll_interval, Duration::from_secs(30));
        assert_eq!(dispatcher.max_concurrent, 5);
        assert!(dispatcher.intervention_markers.matches("requires manual MFA entry"));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("WORKFLOWQ_POLL_INTERVAL_SECS", "5"),
            ("WORKFLOWQ_MAX_CONCURRENT", " 10 "),
            ("WORKFLOWQ_DB_MAX_CONNECTIONS", "8"),
            ("WORKFLOWQ_LOG_FORMAT", "pretty"),
            ("WORKFLOWQ_INTERVENTION_MARKERS", "CAPTCHA, MFA"),
            ("WORKFLOWQ_SHUTDOWN_TIMEOUT_SECS", "0"),
        ])
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.db_max_connections, 8);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.shutdown_timeout, Duration::ZERO);
        assert!(config.intervention_markers.matches("solve the CAPTCHA"));
        assert!(!config.intervention_markers.matches("requires manual review"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = load(&[("WORKFLOWQ_MAX_CONCURRENT", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "WORKFLOWQ_MAX_CONCURRENT", .. }
        ));

        assert!(load(&[("WORKFLOWQ_POLL_INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[("WORKFLOWQ_LOG_FORMAT", "xml")]).is_err());
        assert!(load(&[("WORKFLOWQ_INTERVENTION_MARKERS", " , ")]).is_err());
    }
}
