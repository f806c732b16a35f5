use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};

/// Top-level Flowmill configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: RuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub overdue: OverdueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Static group directory: group id -> member user ids.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

/// Worker pool and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Applied to handlers whose node sets no `timeoutSecs`.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            event_capacity: default_event_capacity(),
            handler_timeout_secs: default_handler_timeout(),
        }
    }
}

fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 256 }
fn default_event_capacity() -> usize { 256 }
fn default_handler_timeout() -> u64 { 30 }

/// Engine-side retry discipline for `errorHandling = "retry"` nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 5000 }

/// Periodic overdue-task scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverdueConfig {
    #[serde(default = "default_overdue_enabled")]
    pub enabled: bool,
    #[serde(default = "default_overdue_interval")]
    pub interval_secs: u64,
}

impl Default for OverdueConfig {
    fn default() -> Self {
        Self {
            enabled: default_overdue_enabled(),
            interval_secs: default_overdue_interval(),
        }
    }
}

fn default_overdue_enabled() -> bool { true }
fn default_overdue_interval() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.flowmill/flowmill.db".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        if config.engine.workers == 0 {
            return Err(FlowError::Config("engine.workers must be at least 1".into()));
        }
        if config.engine.queue_capacity == 0 {
            return Err(FlowError::Config(
                "engine.queue_capacity must be at least 1".into(),
            ));
        }
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        let p = &self.store.path;
        if let Some(rest) = p.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(p)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
