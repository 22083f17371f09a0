//! Orchestrator configuration loading and validation.
//!
//! Reads `config/orchestrator.yaml` and resolves environment variables.
//! Config is the single source of truth for provider endpoints, routing
//! thresholds, loop caps, stream timeouts and SQL connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Env var pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "QUERY_ORCHESTRATOR_CONFIG";

/// Config file location relative to the project root.
const CONFIG_RELATIVE_PATH: &str = "config/orchestrator.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find {CONFIG_RELATIVE_PATH}")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which native protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Raw model invocation, no tools.
    #[serde(rename = "direct_simple")]
    DirectSimple,
    /// OpenAI chat completions with function calling.
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages with `tool_use` blocks.
    #[serde(rename = "anthropic")]
    Anthropic,
    /// Hosted agent endpoint with bearer auth.
    #[serde(rename = "remote_agent")]
    RemoteAgent,
}

/// A single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    /// Model used for the simple tier.
    #[serde(default)]
    pub simple_model: String,
    /// Model used for the complex tier.
    #[serde(default)]
    pub complex_model: String,
    /// Fallback API key when the request carries none. Empty means unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Reasoning budget for providers with native thinking blocks.
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    /// Model name for the given tier.
    pub fn model_for(&self, tier: crate::inference::types::ModelTier) -> &str {
        match tier {
            crate::inference::types::ModelTier::Simple => &self.simple_model,
            crate::inference::types::ModelTier::Complex => &self.complex_model,
        }
    }

    /// Configured API key, treating an empty interpolation result as unset.
    pub fn configured_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.2
}
fn default_thinking_budget() -> u32 {
    2048
}
fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Scores at or above this pick the complex tier.
    pub complexity_threshold: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLoopConfig {
    /// Hard cap on model rounds per turn.
    pub max_rounds: usize,
    /// Concurrent tool executions within one round.
    pub worker_cap: usize,
    /// The single row cap: injected LIMITs, sample sizes, returned rows.
    pub row_cap: usize,
    /// Tool result text beyond this is truncated before reaching the model.
    pub max_tool_result_chars: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            worker_cap: 4,
            row_cap: 100,
            max_tool_result_chars: 6_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_secs: u64,
    /// Producer silence that cancels the request.
    pub idle_timeout_secs: u64,
    /// Wall-clock bound on one streamed request.
    pub overall_timeout_secs: u64,
    /// Bounded channel between the pipeline task and the response body.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            idle_timeout_secs: 90,
            overall_timeout_secs: 300,
            channel_capacity: 64,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// SQLite path; defaults to `memory.db` in the platform data dir.
    pub db_path: Option<String>,
    /// Turns loaded as prior conversation.
    pub recent_turns: usize,
    /// Long-term facts appended to the system prompt.
    pub memory_facts: usize,
    /// Token budget for replayed history.
    pub history_token_budget: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            recent_turns: 5,
            memory_facts: 5,
            history_token_budget: 4_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Token refresh endpoint for the remote-agent provider.
    pub refresh_url: Option<String>,
}

/// A SQL connection served by the reference SQLite executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub sqlite_path: String,
}

/// Top-level configuration (mirrors `config/orchestrator.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub tool_loop: ToolLoopConfig,
    pub stream: StreamConfig,
    pub memory: MemoryConfig,
    pub identity: IdentityConfig,
    pub default_provider: String,
    pub providers: HashMap<String, ProviderConfig>,
    pub connections: HashMap<String, ConnectionConfig>,
    pub default_connection: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                kind: ProviderKind::OpenAi,
                base_url: "https://api.openai.com/v1".to_string(),
                simple_model: "gpt-4o-mini".to_string(),
                complex_model: "gpt-4o".to_string(),
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
                thinking_budget_tokens: default_thinking_budget(),
                request_timeout_secs: default_request_timeout_secs(),
            },
        );
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                kind: ProviderKind::Anthropic,
                base_url: "https://api.anthropic.com/v1".to_string(),
                simple_model: "claude-3-5-haiku-latest".to_string(),
                complex_model: "claude-3-7-sonnet-latest".to_string(),
                api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                max_tokens: 4096,
                temperature: default_temperature(),
                thinking_budget_tokens: default_thinking_budget(),
                request_timeout_secs: default_request_timeout_secs(),
            },
        );

        Self {
            server: ServerConfig::default(),
            routing: RoutingConfig::default(),
            tool_loop: ToolLoopConfig::default(),
            stream: StreamConfig::default(),
            memory: MemoryConfig::default(),
            identity: IdentityConfig::default(),
            default_provider: "openai".to_string(),
            providers,
            connections: HashMap::new(),
            default_connection: None,
        }
    }
}

impl OrchestratorConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.routing.complexity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                reason: format!("routing.complexity_threshold {threshold} is outside [0, 1]"),
            });
        }
        let caps = [
            ("tool_loop.max_rounds", self.tool_loop.max_rounds),
            ("tool_loop.worker_cap", self.tool_loop.worker_cap),
            ("tool_loop.row_cap", self.tool_loop.row_cap),
            ("stream.channel_capacity", self.stream.channel_capacity),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        if !self.providers.contains_key(&self.default_provider) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "default_provider '{}' is not listed under providers",
                    self.default_provider
                ),
            });
        }
        if let Some(ref conn) = self.default_connection {
            if !self.connections.contains_key(conn) {
                return Err(ConfigError::Invalid {
                    reason: format!("default_connection '{conn}' is not listed under connections"),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path.
///
/// Checks `QUERY_ORCHESTRATOR_CONFIG` first, then searches upward from
/// `start` for `config/orchestrator.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text (after env interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<OrchestratorConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: OrchestratorConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Load the config discovered from the current directory, or defaults when
/// no file exists. A file that exists but fails to parse is an error.
pub fn load_or_default() -> Result<OrchestratorConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(&cwd) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading orchestrator config");
            load_config(&path)
        }
        Err(ConfigError::NotFound) => {
            tracing::info!("no config file found, using built-in defaults");
            let config = OrchestratorConfig::default();
            config.validate()?;
            Ok(config)
        }
        Err(e) => Err(e),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
