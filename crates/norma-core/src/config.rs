//! Operational configuration for the orchestrator daemon (ambient concern).
//!
//! Not the excluded CLI front-end: this is the handful of knobs the core needs
//! to know before it can run at all (where the journal and lock live, which
//! budgets apply by default, which binaries to shell out to). Matches the
//! key=value `.norma/config` format and parsing style used by the rest of this
//! codebase's config layer, precedence: environment > config file > defaults.

use crate::id::Id;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Orchestrator operational configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Repository root this orchestrator instance operates on.
    pub repo_root: PathBuf,
    /// `.norma` directory, normally `<repo_root>/.norma`.
    pub norma_dir: PathBuf,
    /// Path to the external tracker binary.
    pub tracker_bin: PathBuf,
    /// Default iteration budget for a PDCA run (`max_iterations`).
    pub max_iterations: u32,
    /// Default wall-clock budget for a single agent invocation, in minutes.
    pub max_wall_time_minutes: Option<u32>,
    /// Default cap on failed Check steps per run.
    pub max_failed_checks: Option<u32>,
    /// Agent command template per role, e.g. `{"plan": "codex", "do": "codex"}`.
    pub agent_commands: HashMap<String, String>,
    /// Poll interval (seconds) when no ready task is found.
    pub poll_interval_secs: u64,
    /// Outer-loop iteration cap, a defensive bound rather than a real limit.
    pub max_loop_iterations: u64,
    /// Whether to additionally mirror subprocess stdout/stderr to the terminal.
    pub debug: bool,
    /// Selection Policy: prefer ready tasks transitively under this feature id.
    pub active_feature_id: Option<Id>,
    /// Selection Policy: prefer ready tasks transitively under this epic id,
    /// consulted only when `active_feature_id` yields no candidates.
    pub active_epic_id: Option<Id>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            norma_dir: PathBuf::from(".norma"),
            tracker_bin: PathBuf::from("tracker"),
            max_iterations: 10,
            max_wall_time_minutes: Some(30),
            max_failed_checks: Some(5),
            agent_commands: HashMap::new(),
            poll_interval_secs: 10,
            max_loop_iterations: 1_000_000,
            debug: false,
            active_feature_id: None,
            active_epic_id: None,
        }
    }
}

impl Config {
    /// Load configuration from `<repo_root>/.norma/config`, falling back to
    /// defaults when the file does not exist.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self {
            repo_root: repo_root.to_path_buf(),
            norma_dir: repo_root.join(".norma"),
            ..Self::default()
        };

        let config_path = config.norma_dir.join("config");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
                path: config_path.clone(),
                source: e,
            })?;
            config.apply_content(&content)?;
        }

        config.apply_env();
        config.resolve_paths();
        Ok(config)
    }

    fn apply_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = strip_quotes(value.trim());
            self.apply_value(key, value)?;
        }
        Ok(())
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "tracker_bin" => self.tracker_bin = PathBuf::from(value),
            "max_iterations" => self.max_iterations = parse_u32(key, value)?,
            "max_wall_time_minutes" => self.max_wall_time_minutes = Some(parse_u32(key, value)?),
            "max_failed_checks" => self.max_failed_checks = Some(parse_u32(key, value)?),
            "poll_interval_secs" => self.poll_interval_secs = parse_u64(key, value)?,
            "debug" => self.debug = parse_bool(key, value)?,
            "active_feature_id" => self.active_feature_id = Some(Id::from_string(value.to_string())),
            "active_epic_id" => self.active_epic_id = Some(Id::from_string(value.to_string())),
            key if key.starts_with("agent.") => {
                let role = key.trim_start_matches("agent.").to_string();
                self.agent_commands.insert(role, value.to_string());
            }
            // Unknown keys are ignored rather than rejected, so forward-compatible
            // config files do not break older orchestrator binaries.
            _ => {}
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("NORMA_TRACKER_BIN") {
            self.tracker_bin = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NORMA_DEBUG") {
            if let Ok(b) = parse_bool("NORMA_DEBUG", &v) {
                self.debug = b;
            }
        }
    }

    /// Resolve any relative paths against `repo_root`.
    fn resolve_paths(&mut self) {
        if self.tracker_bin.is_relative() && self.tracker_bin.components().count() == 1 {
            // A bare command name (e.g. "tracker") is resolved via $PATH at
            // spawn time, not against repo_root.
            return;
        }
        if self.tracker_bin.is_relative() {
            self.tracker_bin = self.repo_root.join(&self.tracker_bin);
        }
    }
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
