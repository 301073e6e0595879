//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How successful cycles affect the idle-cycle counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Idle cycles accumulate over the whole run; work never resets them.
    #[default]
    Cumulative,
    /// A cycle that processed jobs resets the counter to zero.
    ResetOnSuccess,
}

/// Worker configuration.
///
/// Serialized as-is into the worker's registration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, the registration key.
    pub name: String,
    /// Namespace holding the registration and log tables.
    pub ledger_namespace: String,
    /// Wall-clock budget for `run()`. `None` runs until another limit fires.
    #[serde(with = "opt_secs")]
    pub run_duration: Option<Duration>,
    /// Pause between cycles.
    #[serde(with = "secs")]
    pub sleep_duration: Duration,
    /// Stop once more than this many idle cycles were seen. `None` or 0 disables.
    pub max_idled_cycle: Option<u32>,
    /// `LIKE` patterns of queue errors to log and clear every cycle.
    pub autoclear_error_patterns: Vec<String>,
    /// Regex alternatives stripped from schema names in process names.
    pub namespace_prefixes: Vec<String>,
    /// Age after which an orphaned reservation is reclaimed. `<= 0` disables.
    pub stale_timeout_hours: i64,
    pub idle_policy: IdlePolicy,
    /// Ledger retention used by the per-cycle pruning.
    pub log_retention_days: u32,
    /// Forwarded to every populate call.
    pub display_progress: bool,
    /// Deprecated: use `stale_timeout_hours`. Consumed by [`WorkerConfig::normalize`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_stale_reserved_jobs: Option<bool>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "standard_worker".to_string(),
            ledger_namespace: "worker_ledger".to_string(),
            run_duration: None,
            sleep_duration: Duration::from_secs(60),
            max_idled_cycle: None,
            autoclear_error_patterns: Vec::new(),
            namespace_prefixes: vec![String::new()],
            stale_timeout_hours: 24,
            idle_policy: IdlePolicy::Cumulative,
            log_retention_days: 30,
            display_progress: true,
            remove_stale_reserved_jobs: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>, ledger_namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ledger_namespace: ledger_namespace.into(),
            ..Self::default()
        }
    }

    /// Build config from `WORKER_*` environment variables on top of the defaults.
    pub fn from_env(name: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            name: name.into(),
            ..Self::default()
        };
        if config.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "name".to_string(),
                hint: "Every worker needs a name to register under.".to_string(),
            });
        }

        if let Ok(ns) = std::env::var("WORKER_LEDGER_NAMESPACE") {
            if ns.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    key: "WORKER_LEDGER_NAMESPACE".to_string(),
                    hint: "Unset it to use the default 'worker_ledger'.".to_string(),
                });
            }
            config.ledger_namespace = ns.trim().to_string();
        }

        if let Some(secs) = env_parse::<i64>("WORKER_RUN_DURATION")? {
            config.run_duration = u64::try_from(secs).ok().map(Duration::from_secs);
        }

        if let Some(secs) = env_parse::<u64>("WORKER_SLEEP_DURATION")? {
            config.sleep_duration = Duration::from_secs(secs);
        }

        if let Some(max) = env_parse::<i64>("WORKER_MAX_IDLED_CYCLE")? {
            config.max_idled_cycle = u32::try_from(max).ok().filter(|m| *m > 0);
        }

        if let Some(hours) = env_parse::<i64>("WORKER_STALE_TIMEOUT_HOURS")? {
            config.stale_timeout_hours = hours;
        }

        if let Ok(raw) = std::env::var("WORKER_AUTOCLEAR_PATTERNS") {
            config.autoclear_error_patterns = split_list(&raw);
        }

        if let Ok(raw) = std::env::var("WORKER_NAMESPACE_PREFIXES") {
            let prefixes = split_list(&raw);
            config.namespace_prefixes = if prefixes.is_empty() {
                vec![String::new()]
            } else {
                prefixes
            };
        }

        Ok(config)
    }

    /// Fold deprecated settings into their replacements.
    ///
    /// `remove_stale_reserved_jobs = false` disables stale reclamation;
    /// `true` keeps `stale_timeout_hours`. The flag is cleared afterwards.
    pub fn normalize(mut self) -> Self {
        if let Some(remove) = self.remove_stale_reserved_jobs.take() {
            tracing::warn!(
                worker = %self.name,
                "'remove_stale_reserved_jobs' is deprecated and will be removed; use 'stale_timeout_hours' instead"
            );
            if !remove {
                self.stale_timeout_hours = 0;
            }
        }
        self
    }

    /// Idle budget, if enabled.
    pub fn idle_budget(&self) -> Option<u32> {
        self.max_idled_cycle.filter(|m| *m > 0)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e} (got '{raw}')"),
            }),
        _ => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|o| o.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.run_duration, None);
        assert_eq!(config.sleep_duration, Duration::from_secs(60));
        assert_eq!(config.stale_timeout_hours, 24);
        assert_eq!(config.namespace_prefixes, vec![String::new()]);
        assert_eq!(config.log_retention_days, 30);
        assert_eq!(config.idle_policy, IdlePolicy::Cumulative);
        assert!(config.display_progress);
    }

    #[test]
    fn deprecated_false_disables_reclaim() {
        let config = WorkerConfig {
            remove_stale_reserved_jobs: Some(false),
            ..WorkerConfig::default()
        }
        .normalize();
        assert_eq!(config.stale_timeout_hours, 0);
        assert_eq!(config.remove_stale_reserved_jobs, None);
    }

    #[test]
    fn deprecated_true_keeps_timeout() {
        let config = WorkerConfig {
            remove_stale_reserved_jobs: Some(true),
            stale_timeout_hours: 12,
            ..WorkerConfig::default()
        }
        .normalize();
        assert_eq!(config.stale_timeout_hours, 12);
    }

    #[test]
    fn idle_budget_zero_is_disabled() {
        let mut config = WorkerConfig::default();
        config.max_idled_cycle = Some(0);
        assert_eq!(config.idle_budget(), None);
        config.max_idled_cycle = Some(3);
        assert_eq!(config.idle_budget(), Some(3));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let config = WorkerConfig {
            run_duration: Some(Duration::from_secs(3600)),
            ..WorkerConfig::new("w", "ledger")
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["run_duration"], 3600);
        assert_eq!(value["sleep_duration"], 60);
        assert!(value.get("remove_stale_reserved_jobs").is_none());

        let back: WorkerConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn from_env_requires_a_name() {
        let err = WorkerConfig::from_env("  ").unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "name"));
    }

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(
            split_list(" %Timeout% , ,%Deadlock%"),
            vec!["%Timeout%".to_string(), "%Deadlock%".to_string()]
        );
    }
}
