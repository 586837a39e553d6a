//! Telegram Bot API backend.
//!
//! Receives updates either by long-polling `getUpdates` from `start()` or
//! as webhook pushes to `POST /telegram`. No external Telegram crate.

use crate::markup::{self, Dialect, Tag};
use crate::types::{forward, split_message, Backend, BackendError, EventQueue, MessageStream};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use metachat_types::config::TelegramMode;
use metachat_types::message::Message;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Maximum backoff duration on API failures.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Initial backoff duration on API failures.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Long-poll timeout in seconds, sent as `timeout` to getUpdates.
const LONG_POLL_TIMEOUT: u64 = 30;
const TELEGRAM_MSG_LIMIT: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Header carrying the `secret_token` given to `setWebhook`.
pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// Telegram legacy Markdown rendering rules. Strikethrough is not supported
/// and renders as plain text.
pub const TELEGRAM_DIALECT: Dialect = Dialect {
    name: "telegram",
    rules: &[
        (Tag::Bold, "*${1}*"),
        (Tag::Italic, "_${1}_"),
        (Tag::Preformatted, "```${1}```"),
        (Tag::Mention, "@${1}"),
        (Tag::Quote, "Quote from ${1}:\n${2}\n\n"),
        (Tag::Edit, "Edit: ${1}"),
    ],
    escape: Some(escape_markdown),
    pre_escape: None,
    attribution: ("*[", "]* "),
};

/// Backslash-escape the characters legacy Markdown treats as markup.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '_' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Telegram Bot API backend.
pub struct TelegramBackend {
    inner: Arc<TelegramInner>,
    events: EventQueue,
    mode: TelegramMode,
    poll_interval: Duration,
}

struct TelegramInner {
    /// SECURITY: Bot token is zeroized on drop to prevent memory disclosure.
    token: Zeroizing<String>,
    /// Expected value of [`SECRET_TOKEN_HEADER`] on pushed updates.
    secret_token: Option<Zeroizing<String>>,
    client: reqwest::Client,
    tx: mpsc::Sender<Message>,
}

impl TelegramBackend {
    /// Create a new Telegram backend.
    ///
    /// `token` is the raw bot token (read from env by the caller).
    /// `secret_token` authenticates webhook pushes; without it every push
    /// is rejected.
    pub fn new(
        token: String,
        mode: TelegramMode,
        poll_interval: Duration,
        secret_token: Option<String>,
    ) -> Self {
        let events = EventQueue::new();
        let inner = TelegramInner {
            token: Zeroizing::new(token),
            secret_token: secret_token.map(Zeroizing::new),
            client: reqwest::Client::new(),
            tx: events.sender(),
        };
        Self {
            inner: Arc::new(inner),
            events,
            mode,
            poll_interval,
        }
    }

    /// Validate the bot token by calling `getMe`.
    async fn validate_token(&self) -> Result<String, BackendError> {
        let resp = self.inner.client.get(self.inner.url("getMe")).send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::Auth {
                backend: "telegram".to_string(),
                reason: "bot token rejected".to_string(),
            });
        }
        let body: serde_json::Value = resp.json().await?;
        if body["ok"].as_bool() != Some(true) {
            return Err(api_error(&body));
        }
        Ok(body["result"]["username"]
            .as_str()
            .unwrap_or("unknown")
            .to_string())
    }

    /// Long-poll `getUpdates` until the event queue closes.
    ///
    /// Transient failures back off and retry; a conflicting poller or a
    /// revoked token ends the loop with an error.
    async fn poll(&self) -> Result<(), BackendError> {
        let mut offset: Option<i64> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let mut params = json!({
                "timeout": LONG_POLL_TIMEOUT,
                "allowed_updates": ["message", "edited_message"],
            });
            if let Some(off) = offset {
                params["offset"] = json!(off);
            }

            let result = self
                .inner
                .client
                .post(self.inner.url("getUpdates"))
                .json(&params)
                .timeout(Duration::from_secs(LONG_POLL_TIMEOUT + 10))
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, ?backoff, "Telegram getUpdates network error");
                    tokio::time::sleep(backoff).await;
                    backoff = calculate_backoff(backoff);
                    continue;
                }
            };

            let status = resp.status();
            match status.as_u16() {
                429 => {
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    let retry_after = body["parameters"]["retry_after"].as_u64().unwrap_or(5);
                    warn!(retry_after, "Telegram rate limited");
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                    continue;
                }
                409 => {
                    error!("Telegram 409 Conflict: another instance is polling this bot");
                    return Err(BackendError::Api {
                        backend: "telegram".to_string(),
                        reason: "another instance is polling this bot".to_string(),
                    });
                }
                401 => {
                    return Err(BackendError::Auth {
                        backend: "telegram".to_string(),
                        reason: "bot token rejected".to_string(),
                    });
                }
                _ => {}
            }

            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                warn!(%status, body = %body_text, ?backoff, "Telegram getUpdates failed");
                tokio::time::sleep(backoff).await;
                backoff = calculate_backoff(backoff);
                continue;
            }

            let body: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Telegram getUpdates parse error");
                    tokio::time::sleep(backoff).await;
                    backoff = calculate_backoff(backoff);
                    continue;
                }
            };
            backoff = INITIAL_BACKOFF;

            for update in body["result"].as_array().into_iter().flatten() {
                if let Some(update_id) = update["update_id"].as_i64() {
                    offset = Some(update_id + 1);
                }
                let Some(message) = parse_update(update) else {
                    continue;
                };
                debug!(chat = %message.chat, "Telegram message received");
                if let Err(e) = forward(&self.inner.tx, message).await {
                    info!(reason = %e, "Stopping Telegram poll loop");
                    return Ok(());
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl TelegramInner {
    fn secret_matches(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.secret_token else {
            return false;
        };
        let presented = headers
            .get(SECRET_TOKEN_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        presented.ct_eq(expected.as_bytes()).into()
    }

    fn url(&self, method: &str) -> String {
        format!("{TELEGRAM_API_BASE}/bot{}/{method}", self.token.as_str())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), BackendError> {
        for chunk in split_message(text, TELEGRAM_MSG_LIMIT) {
            let body = json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });
            let resp = self
                .client
                .post(self.url("sendMessage"))
                .json(&body)
                .send()
                .await?;
            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(BackendError::Auth {
                    backend: "telegram".to_string(),
                    reason: "bot token rejected".to_string(),
                });
            }
            let result: serde_json::Value = resp.json().await?;
            if result["ok"].as_bool() != Some(true) {
                let description = result["description"].as_str().unwrap_or_default();
                if description.contains("chat not found") {
                    return Err(BackendError::InvalidChat {
                        backend: "telegram".to_string(),
                        chat: chat_id.to_string(),
                    });
                }
                return Err(api_error(&result));
            }
        }
        Ok(())
    }
}

fn api_error(body: &serde_json::Value) -> BackendError {
    BackendError::Api {
        backend: "telegram".to_string(),
        reason: body["description"]
            .as_str()
            .unwrap_or("unknown error")
            .to_string(),
    }
}

/// Calculate exponential backoff capped at MAX_BACKOFF.
pub fn calculate_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[async_trait]
impl Backend for TelegramBackend {
    fn name(&self) -> &str {
        "telegram"
    }

    fn webhook(&self) -> Option<axum::Router> {
        match self.mode {
            TelegramMode::Webhook => Some(
                axum::Router::new()
                    .route("/", post(handle_update))
                    .with_state(self.inner.clone()),
            ),
            TelegramMode::Polling => None,
        }
    }

    async fn start(&self) -> Result<(), BackendError> {
        let bot_name = self.validate_token().await?;
        info!(bot = %bot_name, mode = ?self.mode, "Telegram bot connected");
        match self.mode {
            TelegramMode::Polling => self.poll().await,
            TelegramMode::Webhook => Ok(()),
        }
    }

    fn events(&self) -> Result<MessageStream, BackendError> {
        self.events.take(self.name())
    }

    async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError> {
        let id: i64 = chat_id.parse().map_err(|_| BackendError::InvalidChat {
            backend: "telegram".to_string(),
            chat: chat_id.to_string(),
        })?;
        let text = markup::render_message(message, &TELEGRAM_DIALECT);
        self.inner.send_message(id, &text).await
    }
}

/// Webhook endpoint for pushed updates.
async fn handle_update(
    State(inner): State<Arc<TelegramInner>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !inner.secret_matches(&headers) {
        warn!("Telegram update with invalid secret token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let update: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    if let Some(message) = parse_update(&update) {
        debug!(chat = %message.chat, "Telegram message received");
        if let Err(e) = forward(&inner.tx, message).await {
            warn!(error = %e, "Dropping Telegram update");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    Json(json!({})).into_response()
}

/// Convert an update into a canonical message.
///
/// Handles `message` and `edited_message`; other update kinds and messages
/// without text are skipped.
fn parse_update(update: &serde_json::Value) -> Option<Message> {
    let (msg, edited) = match update.get("message") {
        Some(msg) => (msg, false),
        None => (update.get("edited_message")?, true),
    };

    let chat_id = msg["chat"]["id"].as_i64()?;
    let mut text = format_text(msg)?;

    if let Some(reply) = msg.get("reply_to_message") {
        if let Some(quoted) = format_text(reply) {
            text = format!("{} {text}", markup::quote(&quoted, &author(reply)));
        }
    }
    if edited {
        text = markup::edit(&text);
    }

    Some(Message::new("telegram", chat_id.to_string(), author(msg), text))
}

/// Sender's full name.
fn author(msg: &serde_json::Value) -> String {
    let first = msg["from"]["first_name"].as_str().unwrap_or("");
    let last = msg["from"]["last_name"].as_str().unwrap_or("");
    format!("{first} {last}").trim().to_string()
}

/// Message text with its entities decoded into canonical markup.
///
/// Entity offsets and lengths count UTF-16 code units. Nested or
/// overlapping entities after the first are left as plain text.
fn format_text(msg: &serde_json::Value) -> Option<String> {
    let (text, entities) = match msg["text"].as_str() {
        Some(text) => (text, &msg["entities"]),
        None => (msg["caption"].as_str()?, &msg["caption_entities"]),
    };
    if text.is_empty() {
        return None;
    }

    let units: Vec<u16> = text.encode_utf16().collect();
    let slice = |start: usize, end: usize| String::from_utf16_lossy(&units[start..end]);

    let mut spans: Vec<(usize, usize, &str)> = entities
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|e| {
            let offset = usize::try_from(e["offset"].as_u64()?).ok()?;
            let length = usize::try_from(e["length"].as_u64()?).ok()?;
            Some((offset, offset.checked_add(length)?, e["type"].as_str()?))
        })
        .filter(|(start, end, _)| start < end && *end <= units.len())
        .collect();
    spans.sort_by_key(|(start, _, _)| *start);

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, kind) in spans {
        if start < last {
            continue;
        }
        let payload = slice(start, end);
        let encoded = match kind {
            "bold" => markup::bold(&payload),
            "italic" => markup::italic(&payload),
            "strikethrough" => markup::strikethrough(&payload),
            "code" | "pre" => markup::preformatted(&payload),
            "mention" => markup::mention(payload.strip_prefix('@').unwrap_or(&payload)),
            "text_mention" => markup::mention(&payload),
            _ => continue,
        };
        out.push_str(&slice(last, start));
        out.push_str(&encoded);
        last = end;
    }
    out.push_str(&slice(last, units.len()));
    Some(out)
}
