//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.spacechat/config.json`) and environment.
//! Covers the generation endpoint, window-targeting scores, conversation defaults, and
//! an optional workspace seed used by the CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::window::WindowEntity;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Remote generation endpoint settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Scores used when picking a target window for a tool call.
    #[serde(default)]
    pub targeting: TargetingConfig,

    /// Conversation defaults (user, model, tool rounds).
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Optional window seed for the CLI (no live UI to read windows from).
    #[serde(default)]
    pub workspace: WorkspaceSeed,
}

/// Where and how to reach the streaming generation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Server root (default "http://127.0.0.1:8000").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path for fresh queries.
    #[serde(default = "default_chat_stream_path")]
    pub chat_stream_path: String,

    /// Path for tool-result continuations.
    #[serde(default = "default_tool_output_path")]
    pub tool_output_path: String,

    /// Bearer token. Overridden by SPACECHAT_AUTH_TOKEN env.
    pub auth_token: Option<String>,

    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Longest wait for the response or for the next body chunk. A stream that keeps
    /// producing chunks is never cut off. 0 disables it.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_chat_stream_path() -> String {
    "/claude/chat/stream".to_string()
}

fn default_tool_output_path() -> String {
    "/claude/tool-output".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    120
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_stream_path: default_chat_stream_path(),
            tool_output_path: default_tool_output_path(),
            auth_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Candidate scores for window targeting. Context windows always start above registry-only
/// windows as long as `context_base > registry_base + active_bonus + entity_bonus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingConfig {
    #[serde(default = "default_context_base")]
    pub context_base: u32,
    #[serde(default = "default_registry_base")]
    pub registry_base: u32,
    #[serde(default = "default_active_bonus")]
    pub active_bonus: u32,
    #[serde(default = "default_entity_bonus")]
    pub entity_bonus: u32,
}

fn default_context_base() -> u32 {
    200
}

fn default_registry_base() -> u32 {
    100
}

fn default_active_bonus() -> u32 {
    50
}

fn default_entity_bonus() -> u32 {
    20
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            context_base: default_context_base(),
            registry_base: default_registry_base(),
            active_bonus: default_active_bonus(),
            entity_bonus: default_entity_bonus(),
        }
    }
}

/// Conversation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationConfig {
    /// Owner id stamped on threads and messages, and used to load them back.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Model id passed through to the generation endpoint.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Upper bound on tool round trips within one user turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

fn default_user_id() -> String {
    "local".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tool_rounds() -> usize {
    5
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            default_model: default_model(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

/// Windows the CLI pretends are open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSeed {
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub active_window_id: Option<String>,
    #[serde(default)]
    pub windows: Vec<WindowEntity>,
}

/// Resolve the bearer token: env SPACECHAT_AUTH_TOKEN overrides config.
pub fn resolve_auth_token(config: &Config) -> Option<String> {
    std::env::var("SPACECHAT_AUTH_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .generation
                .auth_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Join the base URL and an endpoint path without doubling or dropping the slash.
pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SPACECHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".spacechat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, SPACECHAT_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
