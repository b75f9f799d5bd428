//! Configuration for autoforge, read from `.autoforge/autoforge.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so a
//! project without a config file runs with the built-in settings.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! backend = "cli"          # cli | http | anthropic
//! model = "claude-sonnet-4-5"
//! claude_cmd = "claude"
//! allowed_tools = ["Read", "Write", "Edit", "Glob", "Grep", "Bash"]
//!
//! [limits]
//! max_rate_limit_retries = 3
//! max_build_validation_cycles = 10
//! inter_session_delay_secs = 3
//! rate_limit_backoff_secs = 60
//! stop_grace_secs = 5
//! readiness_timeout_secs = 10
//! kill_timeout_secs = 5
//!
//! [http]
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [anthropic]
//! base_url = "https://api.anthropic.com"
//! api_key_env = "ANTHROPIC_API_KEY"
//! max_tokens = 8192
//!
//! [store]
//! database = "features.db"
//! validation_category = "build"
//!
//! [hub]
//! observer_buffer = 256
//!
//! [logging]
//! level = "info"
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::Backend;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".autoforge";

/// Name of the config file inside [`STATE_DIR`].
pub const CONFIG_FILE: &str = "autoforge.toml";

/// Agent backend selection and invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub backend: Backend,
    /// Model identifier passed to the backend. `None` lets the backend choose.
    #[serde(default)]
    pub model: Option<String>,
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
    /// Tools allowed in attended mode. Yolo mode skips permission checks entirely.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Edit", "Glob", "Grep", "Bash"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            model: None,
            claude_cmd: None,
            allowed_tools: default_allowed_tools(),
        }
    }
}

/// Circuit breakers and timing for the session loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_max_build_validation_cycles")]
    pub max_build_validation_cycles: u32,
    /// Upper bound on consecutive initializer sessions. Unset means unbounded.
    #[serde(default)]
    pub max_initializer_sessions: Option<u32>,
    #[serde(default = "default_inter_session_delay_secs")]
    pub inter_session_delay_secs: u64,
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_kill_timeout_secs")]
    pub kill_timeout_secs: u64,
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_max_build_validation_cycles() -> u32 {
    10
}

fn default_inter_session_delay_secs() -> u64 {
    3
}

fn default_rate_limit_backoff_secs() -> u64 {
    60
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_readiness_timeout_secs() -> u64 {
    10
}

fn default_kill_timeout_secs() -> u64 {
    5
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_build_validation_cycles: default_max_build_validation_cycles(),
            max_initializer_sessions: None,
            inter_session_delay_secs: default_inter_session_delay_secs(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            kill_timeout_secs: default_kill_timeout_secs(),
        }
    }
}

impl LimitsSection {
    pub fn to_limits(&self) -> Limits {
        Limits {
            max_rate_limit_retries: self.max_rate_limit_retries,
            max_build_validation_cycles: self.max_build_validation_cycles,
            max_initializer_sessions: self.max_initializer_sessions,
            inter_session_delay: Duration::from_secs(self.inter_session_delay_secs),
            rate_limit_backoff: Duration::from_secs(self.rate_limit_backoff_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
        }
    }
}

/// Resolved loop limits with real durations. Tests build this directly with
/// millisecond delays.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_rate_limit_retries: u32,
    pub max_build_validation_cycles: u32,
    pub max_initializer_sessions: Option<u32>,
    pub inter_session_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub stop_grace: Duration,
    pub readiness_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        LimitsSection::default().to_limits()
    }
}

/// OpenAI-compatible streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_base_url")]
    pub base_url: String,
    #[serde(default = "default_http_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_http_model")]
    pub default_model: String,
}

fn default_http_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_http_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_http_model() -> String {
    "gpt-4.1".to_string()
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            base_url: default_http_base_url(),
            api_key_env: default_http_api_key_env(),
            default_model: default_http_model(),
        }
    }
}

/// Anthropic Messages API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicSection {
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_anthropic_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_anthropic_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

impl Default for AnthropicSection {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_base_url(),
            api_key_env: default_anthropic_api_key_env(),
            default_model: default_anthropic_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Work-item store location and the category validation sessions file failures under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_validation_category")]
    pub validation_category: String,
}

fn default_database() -> String {
    "features.db".to_string()
}

fn default_validation_category() -> String {
    "build".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database: default_database(),
            validation_category: default_validation_category(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Per-observer queue depth before events are skipped for that observer.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_observer_buffer() -> usize {
    256
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            observer_buffer: default_observer_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write JSON logs to `.autoforge/logs/`.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// The complete autoforge.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutoforgeToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub anthropic: AnthropicSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AutoforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autoforge.toml")
    }

    /// Load `<state_dir>/autoforge.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize autoforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Claude command: file → `CLAUDE_CMD` → "claude".
    pub fn claude_cmd(&self) -> String {
        self.agent
            .claude_cmd
            .clone()
            .or_else(|| std::env::var("CLAUDE_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.limits.max_rate_limit_retries == 0 {
            warnings.push(
                "max_rate_limit_retries is 0: the first rate limit will crash the agent"
                    .to_string(),
            );
        }
        if self.limits.max_build_validation_cycles == 0 {
            warnings.push(
                "max_build_validation_cycles is 0: build validation will never run".to_string(),
            );
        }
        if self.hub.observer_buffer == 0 {
            warnings.push("observer_buffer must be at least 1; using 1".to_string());
        }
        let key_env = match self.agent.backend {
            Backend::Cli => None,
            Backend::Http => Some(&self.http.api_key_env),
            Backend::Anthropic => Some(&self.anthropic.api_key_env),
        };
        if let Some(var) = key_env
            && std::env::var(var).is_err()
        {
            warnings.push(format!(
                "Backend '{}' selected but {} is not set",
                self.agent.backend, var
            ));
        }

        warnings
    }
}

/// Runtime configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub toml: AutoforgeToml,
    pub verbose: bool,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = AutoforgeToml::load_or_default(&state_dir)?;
        apply_env_overrides(&mut toml);

        Ok(Self {
            log_dir: state_dir.join("logs"),
            tmp_dir: state_dir.join("tmp"),
            state_dir,
            project_dir,
            toml,
            verbose,
        })
    }

    /// Apply CLI flags on top of file and environment settings.
    pub fn with_overrides(mut self, backend: Option<Backend>, model: Option<String>) -> Self {
        if let Some(backend) = backend {
            self.toml.agent.backend = backend;
        }
        if model.is_some() {
            self.toml.agent.model = model;
        }
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    pub fn project_name(&self) -> String {
        project_name_for(&self.project_dir)
    }

    pub fn limits(&self) -> Limits {
        self.toml.limits.to_limits()
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.limits.kill_timeout_secs)
    }
}

/// Project name derived from its directory (last path component).
pub fn project_name_for(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

fn apply_env_overrides(toml: &mut AutoforgeToml) {
    if let Ok(backend) = std::env::var("AUTOFORGE_BACKEND") {
        match backend.parse() {
            Ok(parsed) => toml.agent.backend = parsed,
            Err(e) => tracing::warn!("Ignoring AUTOFORGE_BACKEND: {:#}", e),
        }
    }
    if let Ok(model) = std::env::var("AUTOFORGE_MODEL")
        && !model.trim().is_empty()
    {
        toml.agent.model = Some(model);
    }
}
