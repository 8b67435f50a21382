//! Configuration for the Task Orchestration Engine.
//!
//! Matches the key=value format used by the reference daemon's own config
//! file. Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Engine-wide configuration (Section 9: the one explicit parameter carrying
/// everything that would otherwise be ambient).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of all task/workspace metadata (`<atlas_home>` in Section 3).
    pub atlas_home: PathBuf,
    /// Branch name prefix applied by the Workspace Manager (Section 4.2).
    pub branch_prefix: String,

    // Retry Controller defaults (Section 4.4).
    pub retry_max_attempts: u32,
    pub retry_initial_delay_sec: u32,
    pub retry_multiplier: f64,
    pub retry_max_delay_sec: u32,

    // Command Runner timeouts (Section 5).
    pub ai_timeout_sec: u32,
    pub network_timeout_sec: u32,
    pub validation_timeout_sec: u32,

    // CI Watcher defaults (Section 4.6).
    pub ci_poll_interval_sec: u32,
    pub ci_timeout_sec: u32,

    /// Whether terminal-transition bells are emitted (Section 4.5, 4.6).
    pub bell_enabled: bool,

    // Default validation pipeline commands, used by templates that do not
    // override them (Section 4.5).
    pub default_format_cmds: Vec<String>,
    pub default_lint_cmds: Vec<String>,
    pub default_test_cmds: Vec<String>,
    pub default_pre_commit_cmds: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            atlas_home: default_atlas_home(),
            branch_prefix: "atlas".to_string(),
            retry_max_attempts: 3,
            retry_initial_delay_sec: 2,
            retry_multiplier: 2.0,
            retry_max_delay_sec: 30,
            ai_timeout_sec: 30 * 60,
            network_timeout_sec: 30,
            validation_timeout_sec: 10 * 60,
            ci_poll_interval_sec: 2 * 60,
            ci_timeout_sec: 30 * 60,
            bell_enabled: true,
            default_format_cmds: Vec::new(),
            default_lint_cmds: Vec::new(),
            default_test_cmds: Vec::new(),
            default_pre_commit_cmds: Vec::new(),
        }
    }
}

/// Resolve `~/.local/share/atlas` without depending on a `dirs`-style crate.
fn default_atlas_home() -> PathBuf {
    dirs::data_local_dir().map_or_else(|| PathBuf::from(".atlas"), |d| d.join("atlas"))
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "atlas_home" => self.atlas_home = PathBuf::from(value),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "retry_max_attempts" => self.retry_max_attempts = Self::parse_int(key, value)?,
            "retry_initial_delay_sec" => {
                self.retry_initial_delay_sec = Self::parse_int(key, value)?;
            }
            "retry_multiplier" => {
                self.retry_multiplier = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "retry_max_delay_sec" => self.retry_max_delay_sec = Self::parse_int(key, value)?,
            "ai_timeout_sec" => self.ai_timeout_sec = Self::parse_int(key, value)?,
            "network_timeout_sec" => self.network_timeout_sec = Self::parse_int(key, value)?,
            "validation_timeout_sec" => {
                self.validation_timeout_sec = Self::parse_int(key, value)?;
            }
            "ci_poll_interval_sec" => self.ci_poll_interval_sec = Self::parse_int(key, value)?,
            "ci_timeout_sec" => self.ci_timeout_sec = Self::parse_int(key, value)?,
            "bell_enabled" => self.bell_enabled = Self::parse_bool(key, value)?,
            "default_format_cmds" => self.default_format_cmds = Self::parse_cmd_list(value),
            "default_lint_cmds" => self.default_lint_cmds = Self::parse_cmd_list(value),
            "default_test_cmds" => self.default_test_cmds = Self::parse_cmd_list(value),
            "default_pre_commit_cmds" => {
                self.default_pre_commit_cmds = Self::parse_cmd_list(value);
            }
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Pipe-separated list of shell commands, e.g. `cargo test | cargo clippy`.
    fn parse_cmd_list(value: &str) -> Vec<String> {
        value
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve `atlas_home` against a workspace root when given relatively.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.atlas_home.is_relative() {
            self.atlas_home = workspace_root.join(&self.atlas_home);
        }
    }
}

/// Self-contained stand-in for a `dirs`-style crate, matching the reference
/// implementation's own environment-variable shim.
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    }
}
