//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Command grammar settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Delivery channel pool bounds.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Webhook/KV push server.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Telegram transport. When no bot token resolves, the console transport is used.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Built-in handler options.
    #[serde(default)]
    pub handlers: HandlersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Command prefix character (default '!').
    #[serde(default = "default_prefix")]
    pub prefix: char,
}

fn default_prefix() -> char {
    '!'
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum simultaneously live channels (default 3).
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Close channels unused for this many seconds (default 300). 0 disables idle reclamation.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_channels() -> usize {
    3
}

fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_channels == 0 {
            anyhow::bail!("pool.maxChannels must be at least 1");
        }
        Ok(())
    }
}

/// Webhook bind, port, and API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_webhook_bind")]
    pub bind: String,

    /// Port (default 8080).
    #[serde(default = "default_webhook_port")]
    pub port: u16,

    /// Value the Authorization header must carry. Overridden by COURIER_WEBHOOK_KEY env.
    /// The server does not start without one.
    pub api_key: Option<String>,
}

fn default_webhook_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_port() -> u16 {
    8080
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_webhook_bind(),
            port: default_webhook_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlersConfig {
    /// Auto-reply sent to direct messages while the `busy` KV flag is true.
    #[serde(default = "default_busy_message")]
    pub busy_message: String,
}

fn default_busy_message() -> String {
    "busy right now, will reply later".to_string()
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            busy_message: default_busy_message(),
        }
    }
}

/// Env value when set and non-blank, else the trimmed, non-empty config value.
fn env_or_config(env_key: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(env_key)
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
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the webhook API key: env COURIER_WEBHOOK_KEY overrides config.
pub fn resolve_webhook_key(config: &Config) -> Option<String> {
    env_or_config("COURIER_WEBHOOK_KEY", config.webhook.api_key.as_ref())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_or_config("TELEGRAM_BOT_TOKEN", config.telegram.bot_token.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".courier").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, COURIER_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config: Config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.pool.validate()?;
    Ok((config, path))
}
