use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.kiln/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub tests: TestsConfig,
}

impl Config {
    /// Load config from `~/.kiln/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workspace.validate()?;
        self.context.validate()?;
        self.executor.validate()?;
        self.hardware.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiln")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for per-session workspaces. Defaults to the system
    /// temp dir.
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_bookkeeping_dir")]
    pub bookkeeping_dir: String,
    #[serde(default = "default_manifest_max_entries")]
    pub manifest_max_entries: usize,
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            bookkeeping_dir: default_bookkeeping_dir(),
            manifest_max_entries: default_manifest_max_entries(),
            excluded_dirs: default_excluded_dirs(),
        }
    }
}

impl WorkspaceConfig {
    pub fn root_dir(&self) -> PathBuf {
        match &self.root {
            Some(root) => PathBuf::from(root),
            None => std::env::temp_dir(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bookkeeping_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "workspace.bookkeeping_dir must not be empty".into(),
            ));
        }
        if self.manifest_max_entries == 0 {
            return Err(ConfigError::Validation(
                "workspace.manifest_max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_bookkeeping_dir() -> String {
    ".kiln".into()
}
fn default_manifest_max_entries() -> usize {
    200
}
fn default_excluded_dirs() -> Vec<String> {
    vec![".kiln".into(), ".git".into(), "__pycache__".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_summary_max_words")]
    pub summary_max_words: usize,
    #[serde(default = "default_agent_message_chars")]
    pub agent_message_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_max_words: default_summary_max_words(),
            agent_message_chars: default_agent_message_chars(),
        }
    }
}

impl ContextConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.summary_max_words == 0 {
            return Err(ConfigError::Validation(
                "context.summary_max_words must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_summary_max_words() -> usize {
    500
}
fn default_agent_message_chars() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_command")]
    pub command: String,
    /// Arguments passed to `command`. `{system_prompt}` and `{task_id}` are
    /// substituted per call; the user prompt is written to stdin.
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            args: default_executor_args(),
            timeout_secs: default_executor_timeout(),
        }
    }
}

impl ExecutorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "executor.command must not be empty".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "executor.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_executor_command() -> String {
    "claude".into()
}
fn default_executor_args() -> Vec<String> {
    vec![
        "--print".into(),
        "--append-system-prompt".into(),
        "{system_prompt}".into(),
    ]
}
fn default_executor_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_mpremote")]
    pub mpremote: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_flash_timeout")]
    pub flash_timeout_secs: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mpremote: default_mpremote(),
            python: default_python(),
            flash_timeout_secs: default_flash_timeout(),
        }
    }
}

impl HardwareConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.flash_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "hardware.flash_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_mpremote() -> String {
    "mpremote".into()
}
fn default_python() -> String {
    "python3".into()
}
fn default_flash_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsConfig {
    #[serde(default = "default_python")]
    pub command: String,
    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: default_python(),
            args: default_test_args(),
        }
    }
}

fn default_test_args() -> Vec<String> {
    vec![
        "-m".into(),
        "pytest".into(),
        "tests/".into(),
        "-v".into(),
        "--cov=src".into(),
        "--cov-report=term".into(),
    ]
}
