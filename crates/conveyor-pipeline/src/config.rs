//! Engine configuration: where state lives and how stages are retried.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default state directory, relative to the current working directory.
pub const DEFAULT_HOME: &str = ".conveyor";

/// Configuration shared by the registry, workspaces and driver.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory holding `registry.json` and `workspaces/`.
    pub home: PathBuf,
    pub retry: RetryPolicy,
    /// How long to wait for the registry lock before giving up.
    pub lock_timeout: Duration,
    /// Registry locks older than this are considered abandoned.
    pub stale_lock_after: Duration,
    /// Keep workspaces of completed jobs instead of deleting them.
    pub retain_workspaces: bool,
}

impl EngineConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(30),
            stale_lock_after: Duration::from_secs(120),
            retain_workspaces: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn retain_workspaces(mut self, retain: bool) -> Self {
        self.retain_workspaces = retain;
        self
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join("registry.json")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.home.join("workspaces")
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_home() {
        let config = EngineConfig::new("/tmp/conveyor");
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/conveyor/registry.json"));
        assert_eq!(config.workspaces_dir(), PathBuf::from("/tmp/conveyor/workspaces"));
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.home(), Path::new(DEFAULT_HOME));
        assert!(!config.retain_workspaces);
        assert_eq!(config.retry.max_attempts, 5);
    }
}
