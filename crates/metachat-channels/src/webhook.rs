//! Generic signed JSON webhook backend.
//!
//! Inbound messages are POSTed to `/webhook` as
//! `{"chat": "...", "author": "...", "text": "..."}` with an
//! `X-Webhook-Signature: sha256=<hex>` header (HMAC-SHA256 of the body).
//! Outbound messages are POSTed to the configured callback URL, signed the
//! same way. Text is CommonMark in both directions.

use crate::markup::{self, Dialect, Tag};
use crate::types::{forward, Backend, BackendError, EventQueue, MessageStream};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use hmac::{Hmac, Mac};
use metachat_types::message::Message;
use regex_lite::{Captures, Regex};
use serde_json::json;
use sha2::Sha256;
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const MAX_MESSAGE_LEN: usize = 65535;

/// CommonMark rendering rules.
pub const WEBHOOK_DIALECT: Dialect = Dialect {
    name: "webhook",
    rules: &[
        (Tag::Bold, "**${1}**"),
        (Tag::Italic, "_${1}_"),
        (Tag::Strikethrough, "~~${1}~~"),
        (Tag::Preformatted, "```${1}```"),
        (Tag::Mention, "@${1}"),
        (Tag::Quote, "> ${1}: ${2}\n\n"),
        (Tag::Edit, "_(edited)_ ${1}"),
    ],
    escape: None,
    pre_escape: None,
    attribution: ("**[", "]** "),
};

/// Generic webhook backend.
pub struct WebhookBackend {
    inner: Arc<WebhookInner>,
    events: EventQueue,
    callback_url: Option<String>,
}

struct WebhookInner {
    /// SECURITY: Secret is zeroized on drop.
    secret: Zeroizing<String>,
    client: reqwest::Client,
    tx: mpsc::Sender<Message>,
}

impl WebhookBackend {
    pub fn new(secret: String, callback_url: Option<String>) -> Self {
        let events = EventQueue::new();
        let inner = WebhookInner {
            secret: Zeroizing::new(secret),
            client: reqwest::Client::new(),
            tx: events.sender(),
        };
        Self {
            inner: Arc::new(inner),
            events,
            callback_url,
        }
    }

    /// Whether outbound delivery is configured.
    pub fn has_callback(&self) -> bool {
        self.callback_url.is_some()
    }
}

/// Compute `sha256=<hex>` over `data`.
pub fn compute_signature(secret: &str, data: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header value in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = compute_signature(secret, body);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

#[async_trait]
impl Backend for WebhookBackend {
    fn name(&self) -> &str {
        "webhook"
    }

    fn webhook(&self) -> Option<axum::Router> {
        Some(
            axum::Router::new()
                .route("/", post(handle_inbound))
                .with_state(self.inner.clone()),
        )
    }

    async fn start(&self) -> Result<(), BackendError> {
        if !self.has_callback() {
            warn!("Webhook backend has no callback_url; outbound messages will fail");
        }
        Ok(())
    }

    fn events(&self) -> Result<MessageStream, BackendError> {
        self.events.take(self.name())
    }

    async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError> {
        let url = self.callback_url.as_deref().ok_or_else(|| BackendError::Api {
            backend: "webhook".to_string(),
            reason: "no callback_url configured".to_string(),
        })?;

        let payload = json!({
            "chat": chat_id,
            "author": message.author,
            "text": markup::render_message(message, &WEBHOOK_DIALECT),
            "source": { "backend": message.backend, "chat": message.chat },
        });
        let body = serde_json::to_vec(&payload)?;
        let signature = compute_signature(&self.inner.secret, &body);

        let resp = self
            .inner
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                backend: "webhook".to_string(),
                reason: format!("callback returned {status}: {text}"),
            });
        }
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Inbound endpoint.
async fn handle_inbound(
    State(inner): State<Arc<WebhookInner>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&inner.secret, &body, signature) {
        warn!("Webhook request with invalid signature");
        return error_response(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let Some(message) = parse_body(&payload) else {
        return error_response(StatusCode::BAD_REQUEST, "missing chat or text");
    };

    debug!(chat = %message.chat, "Webhook message received");
    if let Err(e) = forward(&inner.tx, message).await {
        warn!(error = %e, "Dropping webhook message");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "bridge is not running");
    }
    Json(json!({})).into_response()
}

/// Parse an inbound JSON body into a canonical message.
fn parse_body(body: &serde_json::Value) -> Option<Message> {
    let chat = body["chat"].as_str().filter(|c| !c.is_empty())?;
    let text = body["text"].as_str().filter(|t| !t.is_empty())?;
    let author = body["author"].as_str().unwrap_or("");

    let text = if text.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    };

    Some(Message::new("webhook", chat, author, decode(text)))
}

/// Code spans (captures 1 and 2) and bare URLs (capture 3), which inline
/// rules must not touch.
fn span_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:[A-Za-z0-9_+-]*\n)?(.*?)```|`([^`\n]+)`|(https?://[^\s<>]+)")
            .expect("span pattern is valid")
    })
}

fn inline_regexes() -> &'static [(Regex, Tag); 4] {
    static RE: OnceLock<[(Regex, Tag); 4]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            (Regex::new(r"\*\*(.+?)\*\*").expect("bold pattern is valid"), Tag::Bold),
            (Regex::new(r"~~(.+?)~~").expect("strike pattern is valid"), Tag::Strikethrough),
            // Intraword underscores (snake_case) are literal.
            (Regex::new(r"\b_([^_\n]+)_\b").expect("italic pattern is valid"), Tag::Italic),
            (Regex::new(r"\*([^*\n]+)\*").expect("italic pattern is valid"), Tag::Italic),
        ]
    })
}

/// Decode the CommonMark subset into canonical markup.
fn decode(text: &str) -> String {
    markup::protect_spans(
        text,
        span_regex(),
        |caps: &Captures<'_>| match (caps.get(1).or_else(|| caps.get(2)), caps.get(3)) {
            (Some(code), _) => markup::preformatted(code.as_str()),
            (None, Some(url)) => url.as_str().to_string(),
            (None, None) => caps[0].to_string(),
        },
        |rest| {
            let mut out = rest.to_string();
            for (re, tag) in inline_regexes() {
                out = re
                    .replace_all(&out, |caps: &Captures<'_>| markup::encode(*tag, &caps[1]))
                    .into_owned();
            }
            out
        },
    )
}
