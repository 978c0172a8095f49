//! Capability registry
//!
//! Runners and scheduler adapters are registered by name and resolved once,
//! when a session starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::runner::{CaseRunner, ProcessRunner, SchedulerAdapter, ShellAdapter};
use crate::error::ConfigurationError;

#[derive(Default)]
pub struct Registry {
    runners: BTreeMap<String, Arc<dyn CaseRunner>>,
    schedulers: BTreeMap<String, Arc<dyn SchedulerAdapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `process` runner and the `shell` scheduler
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_runner(Arc::new(ProcessRunner::new()));
        registry.register_scheduler(Arc::new(ShellAdapter::new()));
        registry
    }

    pub fn register_runner(&mut self, runner: Arc<dyn CaseRunner>) {
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn register_scheduler(&mut self, scheduler: Arc<dyn SchedulerAdapter>) {
        self.schedulers.insert(scheduler.name().to_string(), scheduler);
    }

    pub fn runner(&self, name: &str) -> Result<Arc<dyn CaseRunner>, ConfigurationError> {
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownCapability(format!("runner '{name}'")))
    }

    pub fn scheduler(&self, name: &str) -> Result<Arc<dyn SchedulerAdapter>, ConfigurationError> {
        self.schedulers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownCapability(format!("scheduler '{name}'")))
    }

    pub fn runner_names(&self) -> Vec<&str> {
        self.runners.keys().map(|k| k.as_str()).collect()
    }

    pub fn scheduler_names(&self) -> Vec<&str> {
        self.schedulers.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.runner("process").unwrap().name(), "process");
        assert_eq!(registry.scheduler("shell").unwrap().name(), "shell");
        assert_eq!(registry.runner_names(), vec!["process"]);
    }

    #[test]
    fn test_unknown_capability() {
        let registry = Registry::new();
        assert!(matches!(
            registry.runner("slurm"),
            Err(ConfigurationError::UnknownCapability(_))
        ));
        assert!(registry.scheduler("slurm").is_err());
    }
}
