//! Runtime configuration
//!
//! Loaded from `~/.skillet/config.toml`. Every field has a default, so a
//! missing file or a partial file is fine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;
use crate::skills::Resource;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Overrides `~/.skillet/skills`
    pub user_skills_dir: Option<PathBuf>,
    /// Project skills directory; usually `<root>/.skillet/skills`
    pub project_skills_dir: Option<PathBuf>,
    /// Skills whose declared permissions need no stored approval
    pub auto_approve: BTreeSet<String>,
    pub rate_limits: RateLimits,
    pub process: ProcessConfig,
}

impl RuntimeConfig {
    /// Load `~/.skillet/config.toml`
    pub async fn load() -> Result<Self> {
        Self::load_from(&paths::config_path()).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config =
            Self::from_toml(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        tracing::info!("Loaded runtime config from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Set the project root; skills are looked up under `<root>/.skillet/skills`
    pub fn with_project_root(mut self, root: &Path) -> Self {
        self.project_skills_dir = Some(paths::project_skills_dir(root));
        self
    }

    pub fn user_skills_dir(&self) -> PathBuf {
        self.user_skills_dir.clone().unwrap_or_else(paths::skills_dir)
    }

    pub fn is_auto_approved(&self, skill: &str) -> bool {
        self.auto_approve.contains(skill)
    }
}

/// Per-turn call limits. Resources without a limit are unmetered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub llm_call: Option<u32>,
    pub shell_exec: Option<u32>,
    pub net_fetch: Option<u32>,
    /// Limits for other resources, keyed by resource name (e.g. `file_write`)
    #[serde(flatten)]
    pub extra: BTreeMap<String, u32>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            llm_call: Some(10),
            shell_exec: Some(20),
            net_fetch: Some(10),
            extra: BTreeMap::new(),
        }
    }
}

impl RateLimits {
    pub fn limit_for(&self, resource: Resource) -> Option<u32> {
        match resource {
            Resource::LlmCall => self.llm_call,
            Resource::ShellExec => self.shell_exec,
            Resource::NetFetch => self.net_fetch,
            other => self.extra.get(other.as_str()).copied(),
        }
    }
}

/// Process backend timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub call_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            shutdown_timeout_ms: 500,
            max_restart_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
        }
    }
}

impl ProcessConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Delay before restart attempt `attempt` (0-based): doubles, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.rate_limits.limit_for(Resource::LlmCall), Some(10));
        assert_eq!(config.rate_limits.limit_for(Resource::ShellExec), Some(20));
        assert_eq!(config.rate_limits.limit_for(Resource::NetFetch), Some(10));
        assert_eq!(config.rate_limits.limit_for(Resource::FileRead), None);
        assert_eq!(config.process.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.process.max_restart_attempts, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let process = ProcessConfig::default();
        assert_eq!(process.backoff(0), Duration::from_millis(50));
        assert_eq!(process.backoff(1), Duration::from_millis(100));
        assert_eq!(process.backoff(4), Duration::from_millis(800));
        assert_eq!(process.backoff(7), Duration::from_millis(5_000));
        assert_eq!(process.backoff(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml(
            r#"
auto_approve = ["git-helper"]

[rate_limits]
shell_exec = 3
file_write = 7

[process]
call_timeout_ms = 1000
"#,
        )
        .unwrap();

        assert!(config.is_auto_approved("git-helper"));
        assert!(!config.is_auto_approved("other"));
        assert_eq!(config.rate_limits.limit_for(Resource::ShellExec), Some(3));
        assert_eq!(config.rate_limits.limit_for(Resource::LlmCall), Some(10));
        assert_eq!(config.rate_limits.limit_for(Resource::FileWrite), Some(7));
        assert_eq!(config.process.call_timeout_ms, 1000);
        assert_eq!(config.process.shutdown_timeout_ms, 500);
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let temp = tempdir().unwrap();
        let config = RuntimeConfig::load_from(&temp.path().join("config.toml"))
            .await
            .unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_project_root() {
        let config = RuntimeConfig::default().with_project_root(Path::new("/repo"));
        assert_eq!(
            config.project_skills_dir,
            Some(PathBuf::from("/repo/.skillet/skills"))
        );
    }
}
