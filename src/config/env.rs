//! Environment variable configuration
//!
//! Provides `BATCHTEST_*` overrides for the session configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "BATCHTEST";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Worker count from BATCHTEST_WORKERS
    pub workers: Option<usize>,
    /// Fail-fast from BATCHTEST_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// Session timeout in seconds from BATCHTEST_TIMEOUT
    pub timeout: Option<f64>,
    /// Work directory from BATCHTEST_WORK_DIR
    pub work_dir: Option<String>,
    /// Pool snapshot from BATCHTEST_POOL
    pub pool: Option<String>,
    /// Broker rendezvous file from BATCHTEST_BROKER
    pub broker: Option<String>,
    /// Config file from BATCHTEST_CONFIG
    pub config_file: Option<String>,
    /// Log filter from BATCHTEST_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            workers: get_env_parse("WORKERS"),
            fail_fast: get_env_bool("FAIL_FAST"),
            timeout: get_env_parse("TIMEOUT"),
            work_dir: get_env("WORK_DIR"),
            pool: get_env("POOL"),
            broker: get_env("BROKER"),
            config_file: get_env("CONFIG"),
            log: get_env("LOG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.workers.is_some()
            || self.fail_fast.is_some()
            || self.timeout.is_some()
            || self.work_dir.is_some()
            || self.pool.is_some()
            || self.broker.is_some()
            || self.config_file.is_some()
            || self.log.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_WORKERS"), workers.to_string()));
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_FAIL_FAST"), fail_fast.to_string()));
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_TIMEOUT"), seconds.to_string()));
        self
    }

    pub fn work_dir(mut self, dir: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_WORK_DIR"), dir.into()));
        self
    }

    pub fn broker(mut self, path: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_BROKER"), path.into()));
        self
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Help text listing every recognized variable
pub fn env_help() -> String {
    format!(
        "Environment Variables:\n\
         \x20 {ENV_PREFIX}_WORKERS     Units dispatched at the same time\n\
         \x20 {ENV_PREFIX}_FAIL_FAST   Stop after the first failing unit (true/false)\n\
         \x20 {ENV_PREFIX}_TIMEOUT     Session timeout in seconds\n\
         \x20 {ENV_PREFIX}_WORK_DIR    Directory for case output and status records\n\
         \x20 {ENV_PREFIX}_POOL        Pool snapshot file\n\
         \x20 {ENV_PREFIX}_BROKER      Broker rendezvous file\n\
         \x20 {ENV_PREFIX}_CONFIG      Path to configuration file\n\
         \x20 {ENV_PREFIX}_LOG         Log filter (e.g. batchtest=debug)\n"
    )
}
