use crate::connection::ReconnectPolicy;
use crate::interpreter::Phase;
use crate::progress::EstimateTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Overrides `api_url` when set.
pub const API_URL_ENV: &str = "PROMPTR_API_URL";
/// Overrides `push_url` when set.
pub const PUSH_URL_ENV: &str = "PROMPTR_PUSH_URL";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Base URL of the HTTP resource API (pull channel).
    pub api_url: String,
    /// WebSocket URL of the push channel.
    pub push_url: String,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Number of push events retained in the in-memory diagnostics log.
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    /// Whether to write the JSONL event log under the home directory.
    #[serde(default = "default_true")]
    pub structured_log: bool,
    /// Expected seconds per phase, overriding the built-in estimates.
    #[serde(default)]
    pub stage_estimates: HashMap<Phase, u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_project_interval_ms")]
    pub project_interval_ms: u64,
    #[serde(default = "default_overview_interval_ms")]
    pub overview_interval_ms: u64,
    #[serde(default = "default_stale_after_failures")]
    pub stale_after_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            project_interval_ms: default_project_interval_ms(),
            overview_interval_ms: default_overview_interval_ms(),
            stale_after_failures: default_stale_after_failures(),
        }
    }
}

impl PollingConfig {
    pub fn project_interval(&self) -> Duration {
        Duration::from_millis(self.project_interval_ms)
    }

    pub fn overview_interval(&self) -> Duration {
        Duration::from_millis(self.overview_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

fn default_project_interval_ms() -> u64 {
    3000
}

fn default_overview_interval_ms() -> u64 {
    5000
}

fn default_stale_after_failures() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_event_log_capacity() -> usize {
    500
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        const DEFAULT_CONFIG_YAML: &str = include_str!("../promptr-sync.yaml");

        serde_yaml::from_str(DEFAULT_CONFIG_YAML)
            .expect("Failed to parse embedded promptr-sync.yaml - this is a bug in the file")
    }

    /// Resolves the effective configuration.
    ///
    /// An explicit path must exist. Otherwise `~/.promptr-sync/config.yaml` is
    /// used when present, falling back to the embedded defaults. Environment
    /// overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match crate::sync_paths::config_path() {
                Ok(path) if path.exists() => Self::load(&path)?,
                _ => Self::default_config(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_url = url.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var(PUSH_URL_ENV) {
            if !url.trim().is_empty() {
                self.push_url = url.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            anyhow::bail!("api_url must not be empty");
        }
        if self.push_url.trim().is_empty() {
            anyhow::bail!("push_url must not be empty");
        }
        if self.polling.project_interval_ms == 0 || self.polling.overview_interval_ms == 0 {
            anyhow::bail!("Polling intervals must be greater than zero");
        }
        if self.polling.stale_after_failures == 0 {
            anyhow::bail!("polling.stale_after_failures must be at least 1");
        }
        if self.reconnect.max_attempts == 0 {
            anyhow::bail!("reconnect.max_attempts must be at least 1");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        if let Some((phase, _)) = self.stage_estimates.iter().find(|(_, secs)| **secs == 0) {
            anyhow::bail!("stage_estimates.{} must be greater than zero", phase.key());
        }
        Ok(())
    }

    /// Built-in per-phase estimates with the configured overrides applied.
    pub fn estimate_table(&self) -> EstimateTable {
        let mut table = EstimateTable::default();
        for (phase, secs) in &self.stage_estimates {
            table.set(*phase, Duration::from_secs(*secs));
        }
        table
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
