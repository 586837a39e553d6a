//! Configuration schema for `metachat.toml`.
//!
//! Secrets are never stored in the file itself: each backend section names
//! the environment variable that holds its token.

use crate::error::{MetachatError, MetachatResult};
use crate::message::Room;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetachatConfig {
    /// Port of the HTTP control surface. Required.
    pub port: Option<u16>,
    /// Address the control surface binds to.
    pub listen_host: IpAddr,
    /// Default log filter (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Relay behavior.
    pub bridge: BridgeConfig,
    /// Room definitions.
    pub rooms: Vec<Room>,
    /// Slack backend; registered only when present.
    pub slack: Option<SlackConfig>,
    /// Telegram backend; registered only when present.
    pub telegram: Option<TelegramConfig>,
    /// Generic JSON webhook backend; registered only when present.
    pub webhook: Option<WebhookConfig>,
}

impl Default for MetachatConfig {
    fn default() -> Self {
        Self {
            port: None,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            log_level: "info".to_string(),
            bridge: BridgeConfig::default(),
            rooms: Vec::new(),
            slack: None,
            telegram: None,
            webhook: None,
        }
    }
}

impl MetachatConfig {
    /// Socket address of the control surface.
    ///
    /// Fails with [`MetachatError::MissingPort`] when the port is unset or zero.
    pub fn listen_addr(&self) -> MetachatResult<SocketAddr> {
        match self.port {
            Some(port) if port != 0 => Ok(SocketAddr::new(self.listen_host, port)),
            _ => Err(MetachatError::MissingPort),
        }
    }
}

/// What the router does when a relay `send` fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailurePolicy {
    /// Stop the router and report the error.
    #[default]
    Abort,
    /// Log the failure and keep delivering to the remaining targets.
    Skip,
}

/// Relay behavior of the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound for a single `send` call in seconds (0 = unbounded).
    pub send_timeout_secs: u64,
    /// Failure policy during relay fan-out.
    pub on_send_failure: SendFailurePolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            on_send_failure: SendFailurePolicy::Abort,
        }
    }
}

/// Slack Events API + Web API backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// Env var holding the bot token (`xoxb-...`).
    pub bot_token_env: String,
    /// Env var holding the Events API verification token.
    pub verification_token_env: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token_env: "SLACK_BOT_TOKEN".to_string(),
            verification_token_env: "SLACK_VERIFICATION_TOKEN".to_string(),
        }
    }
}

/// How the Telegram backend receives updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelegramMode {
    /// Long-poll `getUpdates` from a background loop.
    #[default]
    Polling,
    /// Receive updates on the control surface (`POST /telegram`).
    Webhook,
}

/// Telegram Bot API backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Env var holding the bot token.
    pub bot_token_env: String,
    /// Update delivery mode.
    pub mode: TelegramMode,
    /// Pause between successful polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Env var holding the `secret_token` registered with `setWebhook`.
    /// Required in webhook mode; pushed updates must echo it in the
    /// `X-Telegram-Bot-Api-Secret-Token` header.
    pub secret_token_env: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            mode: TelegramMode::Polling,
            poll_interval_ms: 1000,
            secret_token_env: "TELEGRAM_WEBHOOK_SECRET".to_string(),
        }
    }
}

/// Generic signed JSON webhook backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Env var holding the HMAC-SHA256 shared secret.
    pub secret_env: String,
    /// URL that outbound messages are POSTed to.
    pub callback_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: "METACHAT_WEBHOOK_SECRET".to_string(),
            callback_url: None,
        }
    }
}

/// Read a secret from the named environment variable.
///
/// Missing and empty values are both configuration errors.
pub fn resolve_secret(backend: &str, env_var: &str) -> MetachatResult<String> {
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MetachatError::MissingSecret {
            backend: backend.to_string(),
            env_var: env_var.to_string(),
        }),
    }
}
