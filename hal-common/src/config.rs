//! Configuration management for the Hal Slack bot.
//!
//! The bot reads a single configuration file at `~/.hal/config.json`, with
//! credentials optionally split out into `~/.hal/secrets.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. `secrets.json` (merged under `secrets`)
//! 3. `config.json`
//! 4. Default values
//!
//! # Environment Variable Mapping
//!
//! ## Slack
//! - `SLACK_BOT_TOKEN` → secrets.slack_bot_token
//! - `SLACK_APP_TOKEN` → secrets.slack_app_token
//! - `SLACK_SIGNING_SECRET` → secrets.slack_signing_secret
//! - `SLACK_BOT_USER_ID` → slack.bot_user_id
//!
//! ## Service
//! - `HAL_PORT` → network.port
//! - `HAL_BIND_ADDRESS` → network.bind
//! - `HAL_AGENT_ENDPOINT` → agent.endpoint
//! - `HAL_INACTIVITY_TIMEOUT_SECS` → session.inactivity_timeout_secs
//! - `HAL_MEMORY_DIR` → agent.teach.path_to_db_dir
//! - `HAL_LOG_LEVEL` / `HAL_LOG_FORMAT` → observability.*

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_loader::load_modular_config;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".hal"),
        |dirs| dirs.home_dir().join(".hal"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// HTTP listener configuration (health probes, Events API webhook).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address.
    /// Default: "127.0.0.1" (local only)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4431
}

// ============================================================================
// Secrets Configuration
// ============================================================================

/// Slack credentials.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Bot token (`xoxb-...`) used for the Web API.
    #[serde(default)]
    pub slack_bot_token: Option<String>,

    /// App-level token (`xapp-...`) used to open Socket Mode connections.
    #[serde(default)]
    pub slack_app_token: Option<String>,

    /// Signing secret used to verify Events API requests.
    #[serde(default)]
    pub slack_signing_secret: Option<String>,
}

// ============================================================================
// Slack Configuration
// ============================================================================

/// How Slack events reach the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlackMode {
    /// WebSocket connection opened with the app-level token.
    #[default]
    Socket,
    /// HTTP push to `/slack/events`.
    EventsApi,
}

impl SlackMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::EventsApi => "events_api",
        }
    }
}

/// Slack channel configuration.
///
/// Tokens are stored in `secrets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub mode: SlackMode,

    /// The bot's own user id, used to ignore its replies and mentions in
    /// plain message events. Resolved via `auth.test` when absent.
    #[serde(default)]
    pub bot_user_id: Option<String>,

    /// Users allowed to talk to the bot. `*` allows everyone.
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,

    /// Web API base URL (overridable for tests).
    #[serde(default = "default_slack_api_base")]
    pub api_base_url: String,

    /// Delay before reconnecting a dropped Socket Mode connection.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            mode: SlackMode::default(),
            bot_user_id: None,
            allowed_users: default_allowed_users(),
            api_base_url: default_slack_api_base(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".into()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

// ============================================================================
// Agent Configuration
// ============================================================================

const DEFAULT_SYSTEM_MESSAGE: &str = "You are an direct response copywriting expert, adept at persuasive sales copy, who remembers user teachings from prior chats. You're inspired by copywriting legends like Clayton Makepeace and Gary Halbert.

GOALS:
* Help the user complete copywriting tasks (e.g. writing, editing, critiquing, etc).

TASKS INCLUDE:
* Sales Letters, VSLs, YouTube Ads, Affiliate Emails, Subject Lines, etc.

CAREFULLY FOLLOW THESE RULES:
* Never describe your own behavior
* Keep responses conversational and direct
* Exhibit unpredictable, human-like thought and rhythm
* Always give specific details and avoid clichés and common phrases
* Show-don't-tell using simple non-flowery words, targeting a 6th-grade comprehension";

/// Agent framework integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent service base URL.
    #[serde(default = "default_agent_endpoint")]
    pub endpoint: String,

    /// Name given to every teachable agent.
    #[serde(default = "default_agent_name")]
    pub name: String,

    #[serde(default = "default_system_message")]
    pub system_message: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub teach: TeachConfig,

    /// Upper bound for a single agent call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: default_agent_endpoint(),
            name: default_agent_name(),
            system_message: default_system_message(),
            llm: LlmConfig::default(),
            teach: TeachConfig::default(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_agent_endpoint() -> String {
    "http://127.0.0.1:4400".into()
}

fn default_agent_name() -> String {
    "hal".into()
}

fn default_system_message() -> String {
    DEFAULT_SYSTEM_MESSAGE.into()
}

fn default_call_timeout_secs() -> u64 {
    660
}

/// LLM settings forwarded to the agent framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Allowed model names.
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request LLM timeout, in seconds.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub use_cache: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            use_cache: true,
        }
    }
}

fn default_models() -> Vec<String> {
    vec!["gpt-4".into(), "gpt4".into(), "gpt-4-32k".into()]
}

fn default_temperature() -> f32 {
    0.5
}

fn default_llm_timeout_secs() -> u64 {
    600
}

/// Long-term memory settings for the teachable agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeachConfig {
    #[serde(default)]
    pub verbosity: u8,

    /// Wipe the memory store when an agent is created.
    #[serde(default)]
    pub reset_db: bool,

    /// Directory of the memory store. `~` is expanded.
    #[serde(default = "default_memory_dir")]
    pub path_to_db_dir: String,

    /// Maximum embedding distance for recalled memos.
    #[serde(default = "default_recall_threshold")]
    pub recall_threshold: f32,
}

impl Default for TeachConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            reset_db: false,
            path_to_db_dir: default_memory_dir(),
            recall_threshold: default_recall_threshold(),
        }
    }
}

impl TeachConfig {
    /// Memory directory with `~` and environment variables expanded.
    pub fn resolved_db_dir(&self) -> String {
        shellexpand::full(&self.path_to_db_dir)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| self.path_to_db_dir.clone())
    }
}

fn default_memory_dir() -> String {
    "~/.hal/memory".into()
}

fn default_recall_threshold() -> f32 {
    1.5
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Conversation session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a thread's session is cleaned up.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Whether a mention restarts the agent conversation from scratch.
    #[serde(default = "default_true")]
    pub mention_clears_history: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            mention_clears_history: true,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

fn default_inactivity_timeout_secs() -> u64 {
    180
}

// ============================================================================
// Observability Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to set to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub slack: SlackConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default directory, then apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&config_dir())
    }

    /// Load `config.json` + `secrets.json` from a directory, then apply
    /// environment overrides.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let value = load_modular_config(Some(dir.to_path_buf()))?;
        let mut config: Self = serde_json::from_value(value)
            .with_context(|| format!("Failed to parse config in {}", dir.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file, without secrets merging or
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = var("SLACK_BOT_TOKEN") {
            self.secrets.slack_bot_token = Some(token);
        }
        if let Some(token) = var("SLACK_APP_TOKEN") {
            self.secrets.slack_app_token = Some(token);
        }
        if let Some(secret) = var("SLACK_SIGNING_SECRET") {
            self.secrets.slack_signing_secret = Some(secret);
        }
        if let Some(user) = var("SLACK_BOT_USER_ID") {
            self.slack.bot_user_id = Some(user);
        }

        if let Some(port) = var("HAL_PORT").and_then(|p| p.parse().ok()) {
            self.network.port = port;
        }
        if let Some(bind) = var("HAL_BIND_ADDRESS") {
            self.network.bind = bind;
        }
        if let Some(endpoint) = var("HAL_AGENT_ENDPOINT") {
            self.agent.endpoint = endpoint;
        }
        if let Some(secs) = var("HAL_INACTIVITY_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            self.session.inactivity_timeout_secs = secs;
        }
        if let Some(dir) = var("HAL_MEMORY_DIR") {
            self.agent.teach.path_to_db_dir = dir;
        }

        if let Some(level) = var("HAL_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = var("HAL_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Get the Slack bot token.
    pub fn slack_bot_token(&self) -> Option<String> {
        self.secrets.slack_bot_token.clone()
    }

    /// Get the Slack app-level token.
    pub fn slack_app_token(&self) -> Option<String> {
        self.secrets.slack_app_token.clone()
    }

    /// Get the Slack signing secret.
    pub fn slack_signing_secret(&self) -> Option<String> {
        self.secrets.slack_signing_secret.clone()
    }

    /// Socket address string for the HTTP listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.port)
    }
}
