//! Configuration module
//!
//! A [`SessionConfig`] is built from defaults, an optional config file and
//! `BATCHTEST_*` environment variables; command-line flags are applied last by
//! the caller. The result is passed explicitly into the driver.

mod env;
mod file;

pub use env::{env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::{expand_path, find_config, is_yaml_file, CONFIG_LOCATIONS};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::{NodeShape, Partitioner, Strategy};
use crate::error::ConfigurationError;
use crate::executor::DriverConfig;
use crate::resource::DEFAULT_MAX_BYPASS;

/// Settings of one test session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Units dispatched at the same time
    pub workers: usize,

    /// Stop the whole session after the first unit that does not succeed
    pub fail_fast: bool,

    /// Session timeout in seconds
    pub timeout: Option<f64>,

    /// Default per-case timeout in seconds
    pub case_timeout: Option<f64>,

    /// How ready cases are grouped into batches
    pub batching: Strategy,

    /// Put composite cases in a trailing batch of their own
    pub exempt_composite: bool,

    /// How often a blocked allocation may be overtaken
    pub max_bypass: usize,

    /// Case runner capability
    pub runner: String,

    /// Scheduler capability; batches run in-process when unset
    pub scheduler: Option<String>,

    pub work_dir: PathBuf,

    /// Pool snapshot file
    pub pool: Option<PathBuf>,

    /// Broker rendezvous file; the pool is shared through the broker when set
    pub broker: Option<PathBuf>,

    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fail_fast: false,
            timeout: None,
            case_timeout: None,
            batching: Strategy::Single,
            exempt_composite: false,
            max_bypass: DEFAULT_MAX_BYPASS,
            runner: "process".to_string(),
            scheduler: None,
            work_dir: PathBuf::from("batchtest-work"),
            pool: None,
            broker: None,
            poll_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };
        Ok(config)
    }

    /// Load the first config file found in the standard locations, or defaults
    pub fn load_default() -> Result<Self> {
        match find_config() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Overlay values set in the environment
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(workers) = env.workers {
            self.workers = workers;
        }
        if let Some(fail_fast) = env.fail_fast {
            self.fail_fast = fail_fast;
        }
        if let Some(timeout) = env.timeout {
            self.timeout = Some(timeout);
        }
        if let Some(dir) = &env.work_dir {
            self.work_dir = expand_path(dir);
        }
        if let Some(pool) = &env.pool {
            self.pool = Some(expand_path(pool));
        }
        if let Some(broker) = &env.broker {
            self.broker = Some(expand_path(broker));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        for (name, value) in [("timeout", self.timeout), ("case_timeout", self.case_timeout)] {
            if let Some(v) = value {
                if v.is_nan() || v <= 0.0 {
                    return Err(invalid(name, "must be a positive number of seconds"));
                }
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be positive"));
        }
        Partitioner::new(self.batching.clone())
            .validate()
            .map_err(|e| invalid("batching", &e.to_string()))
    }

    pub fn partitioner(&self, shape: NodeShape) -> Partitioner {
        Partitioner::new(self.batching.clone())
            .with_exempt_composite(self.exempt_composite)
            .with_shape(shape)
    }

    /// Driver settings; call [`validate`](Self::validate) first
    pub fn driver_config(&self, shape: NodeShape) -> DriverConfig {
        DriverConfig::default()
            .with_workers(self.workers)
            .with_fail_fast(self.fail_fast)
            .with_session_timeout(self.timeout.and_then(|t| Duration::try_from_secs_f64(t).ok()))
            .with_case_timeout(
                self.case_timeout
                    .and_then(|t| Duration::try_from_secs_f64(t).ok()),
            )
            .with_work_dir(self.work_dir.clone())
            .with_partitioner(self.partitioner(shape))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
    }
}

fn invalid(name: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{MatchMode, PackingStrategy};
    use crate::models::NodeAffinity;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_bypass, 8);
        assert_eq!(config.runner, "process");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_config_with_batching() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batchtest.yaml");
        std::fs::write(
            &path,
            "workers: 8\nfail_fast: true\nbatching:\n  strategy: duration\n  limit: 600\n  affinity: match\n  match_mode: upper_bound\n",
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.workers, 8);
        assert!(config.fail_fast);
        assert_eq!(
            config.batching,
            Strategy::Duration {
                limit: 600.0,
                affinity: NodeAffinity::Match,
                match_mode: MatchMode::UpperBound,
            }
        );
        assert_eq!(config.work_dir, PathBuf::from("batchtest-work"));
    }

    #[test]
    fn test_save_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SessionConfig {
            batching: Strategy::Pack {
                width: 16,
                height: 3600.0,
                packing: PackingStrategy::BestFit,
            },
            scheduler: Some("shell".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = SessionConfig::default();
        let env = EnvConfig {
            workers: Some(2),
            fail_fast: Some(true),
            work_dir: Some("/tmp/bt".into()),
            ..Default::default()
        };
        config.apply_env(&env);
        assert_eq!(config.workers, 2);
        assert!(config.fail_fast);
        assert_eq!(config.work_dir, PathBuf::from("/tmp/bt"));
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn test_validate() {
        let zero = SessionConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigurationError::InvalidSetting { .. })
        ));

        let negative = SessionConfig {
            case_timeout: Some(-1.0),
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let bad_batching = SessionConfig {
            batching: Strategy::Count { count: 0 },
            ..Default::default()
        };
        assert!(bad_batching.validate().is_err());
    }

    #[test]
    fn test_driver_config() {
        let config = SessionConfig {
            workers: 3,
            timeout: Some(1.5),
            batching: Strategy::Count { count: 5 },
            exempt_composite: true,
            ..Default::default()
        };
        let driver = config.driver_config(NodeShape::default());
        assert_eq!(driver.workers, 3);
        assert_eq!(driver.session_timeout, Some(Duration::from_millis(1500)));
        assert!(driver.partitioner.exempt_composite);
        assert!(driver.partitioner.is_batching());
    }
}
