//! Config file loading and the starter template written by `metachat init`.

use metachat_types::config::MetachatConfig;
use metachat_types::error::{MetachatError, MetachatResult};
use std::path::Path;
use tracing::info;

/// Commented starter configuration.
pub const STARTER_CONFIG: &str = r#"# Metachat configuration.
#
# Secrets never live in this file: each backend names the environment
# variable holding its token.

# Port of the HTTP control surface (health check, manual posts, webhooks).
port = 8080
log_level = "info"

[bridge]
# Upper bound for one delivery, in seconds (0 disables the limit).
send_timeout_secs = 30
# "abort" stops the bridge on a failed relay, "skip" logs it and continues.
on_send_failure = "abort"

# A room relays every message to all of its other chats.
# Send "metachat chatID" in a chat to learn its id.
#
# [[rooms]]
# name = "general"
# chats = [
#   { backend = "slack", id = "C0123456" },
#   { backend = "telegram", id = "-100123456" },
# ]

# A backend is enabled when its section is present.
#
# [slack]
# bot_token_env = "SLACK_BOT_TOKEN"
# verification_token_env = "SLACK_VERIFICATION_TOKEN"
#
# [telegram]
# bot_token_env = "TELEGRAM_BOT_TOKEN"
# mode = "polling"          # or "webhook" (POST /telegram)
# poll_interval_ms = 1000
# secret_token_env = "TELEGRAM_WEBHOOK_SECRET"   # webhook mode only
#
# [webhook]
# secret_env = "METACHAT_WEBHOOK_SECRET"
# callback_url = "https://example.com/metachat"
"#;

/// Read and parse the config file at `path`.
pub fn load_config(path: &Path) -> MetachatResult<MetachatConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MetachatError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let config: MetachatConfig = toml::from_str(&contents)?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Write [`STARTER_CONFIG`] to `path`, refusing to overwrite.
pub fn write_starter_config(path: &Path) -> MetachatResult<()> {
    if path.exists() {
        return Err(MetachatError::Config(format!(
            "{} already exists, not overwriting",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_CONFIG)?;
    Ok(())
}
