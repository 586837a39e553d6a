//! Backend construction from configuration.

use metachat_channels::slack::SlackBackend;
use metachat_channels::telegram::TelegramBackend;
use metachat_channels::types::Backend;
use metachat_channels::webhook::WebhookBackend;
use metachat_types::config::{resolve_secret, MetachatConfig, TelegramMode};
use metachat_types::error::MetachatResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Instantiate every backend whose config section is present.
///
/// Fails when a referenced secret is missing from the environment.
pub fn build_backends(config: &MetachatConfig) -> MetachatResult<Vec<Arc<dyn Backend>>> {
    let mut backends: Vec<Arc<dyn Backend>> = Vec::new();

    if let Some(slack) = &config.slack {
        let bot_token = resolve_secret("slack", &slack.bot_token_env)?;
        let verification_token = resolve_secret("slack", &slack.verification_token_env)?;
        backends.push(Arc::new(SlackBackend::new(bot_token, verification_token)));
        info!(backend = "slack", "Backend configured");
    }

    if let Some(telegram) = &config.telegram {
        let token = resolve_secret("telegram", &telegram.bot_token_env)?;
        let secret_token = match telegram.mode {
            TelegramMode::Webhook => Some(resolve_secret("telegram", &telegram.secret_token_env)?),
            TelegramMode::Polling => None,
        };
        backends.push(Arc::new(TelegramBackend::new(
            token,
            telegram.mode,
            Duration::from_millis(telegram.poll_interval_ms),
            secret_token,
        )));
        info!(backend = "telegram", mode = ?telegram.mode, "Backend configured");
    }

    if let Some(webhook) = &config.webhook {
        let secret = resolve_secret("webhook", &webhook.secret_env)?;
        backends.push(Arc::new(WebhookBackend::new(
            secret,
            webhook.callback_url.clone(),
        )));
        info!(backend = "webhook", "Backend configured");
    }

    Ok(backends)
}
