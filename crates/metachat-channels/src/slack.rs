//! Slack backend.
//!
//! Receives messages through the Events API (pushed to the control surface
//! at `POST /slack`) and sends through the Web API with a bot token. No
//! external Slack crate.

use crate::markup::{self, Dialect, Tag};
use crate::types::{forward, split_message, Backend, BackendError, EventQueue, MessageStream};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use dashmap::DashMap;
use metachat_types::message::Message;
use regex_lite::{Captures, Regex};
use std::sync::{Arc, OnceLock};
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const SLACK_API_BASE: &str = "https://slack.com/api";
const SLACK_MSG_LIMIT: usize = 3000;
const USERS_PAGE_SIZE: u32 = 200;

/// Slack mrkdwn rendering rules.
pub const SLACK_DIALECT: Dialect = Dialect {
    name: "slack",
    rules: &[
        (Tag::Bold, "*${1}*"),
        (Tag::Italic, "_${1}_"),
        (Tag::Strikethrough, "~${1}~"),
        (Tag::Preformatted, "```${1}```"),
        (Tag::Mention, "@${1}"),
        (Tag::Quote, "Quote from ${1}:\n${2}\n\n"),
        (Tag::Edit, "Edit: ${1}"),
    ],
    escape: Some(escape_entities),
    pre_escape: Some(escape_entities),
    attribution: ("*[", "]* "),
};

/// Escape the three characters Slack reserves for control sequences.
///
/// Literal `<` must never reach Slack unescaped: `<!channel>` or
/// `<url|label>` typed on another platform would be read as markup.
fn escape_entities(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Slack Events API + Web API backend.
pub struct SlackBackend {
    inner: Arc<SlackInner>,
    events: EventQueue,
}

struct SlackInner {
    /// SECURITY: Tokens are zeroized on drop to prevent memory disclosure.
    bot_token: Zeroizing<String>,
    verification_token: Zeroizing<String>,
    client: reqwest::Client,
    /// User id -> display name.
    users: DashMap<String, String>,
    /// Bot's own user ID (populated after auth.test).
    bot_user_id: RwLock<Option<String>>,
    tx: mpsc::Sender<Message>,
}

impl SlackBackend {
    pub fn new(bot_token: String, verification_token: String) -> Self {
        let events = EventQueue::new();
        let inner = SlackInner {
            bot_token: Zeroizing::new(bot_token),
            verification_token: Zeroizing::new(verification_token),
            client: reqwest::Client::new(),
            users: DashMap::new(),
            bot_user_id: RwLock::new(None),
            tx: events.sender(),
        };
        Self {
            inner: Arc::new(inner),
            events,
        }
    }
}

impl SlackInner {
    /// Call a Web API method and check Slack's `ok` flag.
    async fn call(
        &self,
        method: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, BackendError> {
        let url = format!("{SLACK_API_BASE}/{method}");
        let request = match body {
            Some(body) => self.client.post(url).json(&body),
            None => self.client.get(url).query(query),
        };
        let resp: serde_json::Value = request
            .header(
                "Authorization",
                format!("Bearer {}", self.bot_token.as_str()),
            )
            .send()
            .await?
            .json()
            .await?;

        if resp["ok"].as_bool() == Some(true) {
            return Ok(resp);
        }
        let reason = resp["error"].as_str().unwrap_or("unknown error").to_string();
        Err(match reason.as_str() {
            "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" => {
                BackendError::Auth {
                    backend: "slack".to_string(),
                    reason,
                }
            }
            _ => BackendError::Api {
                backend: "slack".to_string(),
                reason: format!("{method}: {reason}"),
            },
        })
    }

    /// Fill the user cache from `users.list`, following pagination.
    async fn load_users(&self) -> Result<(), BackendError> {
        let mut cursor = String::new();
        loop {
            let mut query = vec![("limit", USERS_PAGE_SIZE.to_string())];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }
            let resp = self.call("users.list", &query, None).await?;
            for member in resp["members"].as_array().into_iter().flatten() {
                if let (Some(id), Some(name)) = (member["id"].as_str(), display_name(member)) {
                    self.users.insert(id.to_string(), name);
                }
            }
            cursor = resp["response_metadata"]["next_cursor"]
                .as_str()
                .unwrap_or("")
                .to_string();
            if cursor.is_empty() {
                return Ok(());
            }
        }
    }

    /// Display name for a user id, asking `users.info` on a cache miss.
    async fn user_name(&self, id: &str) -> Option<String> {
        if let Some(name) = self.users.get(id) {
            return Some(name.value().clone());
        }
        match self
            .call("users.info", &[("user", id.to_string())], None)
            .await
        {
            Ok(resp) => {
                let name = display_name(&resp["user"])?;
                self.users.insert(id.to_string(), name.clone());
                Some(name)
            }
            Err(e) => {
                warn!(user = %id, error = %e, "Slack user lookup failed");
                None
            }
        }
    }

    async fn post_message(&self, channel: &str, text: &str) -> Result<(), BackendError> {
        for chunk in split_message(text, SLACK_MSG_LIMIT) {
            let body = serde_json::json!({
                "channel": channel,
                "text": chunk,
                "mrkdwn": true,
                "unfurl_links": true,
            });
            if let Err(e) = self.call("chat.postMessage", &[], Some(body)).await {
                return Err(match e {
                    BackendError::Api { reason, .. } if reason.ends_with("channel_not_found") => {
                        BackendError::InvalidChat {
                            backend: "slack".to_string(),
                            chat: channel.to_string(),
                        }
                    }
                    other => other,
                });
            }
        }
        Ok(())
    }

    /// Decode message text, resolving every mentioned user through the cache.
    async fn decode_text(&self, text: &str) -> String {
        for id in mentioned_users(text) {
            self.user_name(&id).await;
        }
        decode(text, |id| self.users.get(id).map(|n| n.value().clone()))
    }

    fn token_matches(&self, token: &str) -> bool {
        token
            .as_bytes()
            .ct_eq(self.verification_token.as_bytes())
            .into()
    }
}

/// Best available human-readable name of a Slack user object.
fn display_name(user: &serde_json::Value) -> Option<String> {
    [
        &user["real_name"],
        &user["profile"]["real_name"],
        &user["profile"]["display_name"],
        &user["name"],
    ]
    .into_iter()
    .filter_map(|v| v.as_str())
    .find(|s| !s.is_empty())
    .map(str::to_string)
}

#[async_trait]
impl Backend for SlackBackend {
    fn name(&self) -> &str {
        "slack"
    }

    fn webhook(&self) -> Option<axum::Router> {
        Some(
            axum::Router::new()
                .route("/", post(handle_events))
                .with_state(self.inner.clone()),
        )
    }

    async fn start(&self) -> Result<(), BackendError> {
        let resp = self.inner.call("auth.test", &[], None).await?;
        let bot_id = resp["user_id"].as_str().unwrap_or_default().to_string();
        info!(bot_user_id = %bot_id, "Slack bot authenticated");
        *self.inner.bot_user_id.write().await = Some(bot_id);

        self.inner.load_users().await?;
        info!(users = self.inner.users.len(), "Slack user cache loaded");
        Ok(())
    }

    fn events(&self) -> Result<MessageStream, BackendError> {
        self.events.take(self.name())
    }

    async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError> {
        let text = markup::render_message(message, &SLACK_DIALECT);
        self.inner.post_message(chat_id, &text).await
    }
}

/// Events API endpoint.
async fn handle_events(State(inner): State<Arc<SlackInner>>, body: String) -> Response {
    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    if !inner.token_matches(payload["token"].as_str().unwrap_or("")) {
        warn!("Slack event with invalid verification token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match payload["type"].as_str() {
        Some("url_verification") => {
            let challenge = payload["challenge"].as_str().unwrap_or("").to_string();
            challenge.into_response()
        }
        Some("event_callback") => {
            let bot_id = inner.bot_user_id.read().await.clone();
            let Some(event) = parse_message_event(&payload["event"], bot_id.as_deref()) else {
                return StatusCode::OK.into_response();
            };

            let author = inner
                .user_name(event.user)
                .await
                .unwrap_or_else(|| event.user.to_string());
            let mut text = inner.decode_text(event.text).await;
            if event.edited {
                text = markup::edit(&text);
            }

            let message = Message::new("slack", event.channel, author, text);
            debug!(chat = %message.chat, "Slack message received");
            if let Err(e) = forward(&inner.tx, message).await {
                warn!(error = %e, "Dropping Slack message");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            StatusCode::OK.into_response()
        }
        _ => StatusCode::OK.into_response(),
    }
}

/// The parts of a message event the bridge relays.
#[derive(Debug, PartialEq)]
struct InboundEvent<'a> {
    channel: &'a str,
    user: &'a str,
    text: &'a str,
    edited: bool,
}

/// Extract a relayable user message from an Events API `event` object.
///
/// Skips bot messages, the bot's own messages and subtypes other than edits.
fn parse_message_event<'a>(
    event: &'a serde_json::Value,
    bot_user_id: Option<&str>,
) -> Option<InboundEvent<'a>> {
    if event["type"].as_str()? != "message" {
        return None;
    }

    let (data, edited) = match event["subtype"].as_str() {
        Some("message_changed") => (event.get("message")?, true),
        Some(_) => return None,
        None => (event, false),
    };

    if data.get("bot_id").is_some() {
        return None;
    }
    let user = data["user"].as_str()?;
    if Some(user) == bot_user_id {
        return None;
    }
    let text = data["text"].as_str().unwrap_or("");
    if text.is_empty() {
        return None;
    }

    Some(InboundEvent {
        channel: event["channel"].as_str()?,
        user,
        text,
        edited,
    })
}

fn span_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(.*?)```|<([^<>]+)>").expect("slack span pattern is valid"))
}

fn inline_regexes() -> &'static [(Regex, Tag); 3] {
    static RE: OnceLock<[(Regex, Tag); 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            (Regex::new(r"\*([^*\n]+)\*").expect("bold pattern is valid"), Tag::Bold),
            (Regex::new(r"_([^_\n]+)_").expect("italic pattern is valid"), Tag::Italic),
            (Regex::new(r"~([^~\n]+)~").expect("strike pattern is valid"), Tag::Strikethrough),
        ]
    })
}

/// User ids referenced by `<@U…>` mentions.
fn mentioned_users(text: &str) -> Vec<String> {
    span_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(2))
        .filter_map(|m| m.as_str().strip_prefix('@'))
        .map(|rest| rest.split('|').next().unwrap_or(rest).to_string())
        .collect()
}

/// Decode Slack mrkdwn into canonical markup.
///
/// `resolve` maps a user id to a display name for mentions.
fn decode<F>(text: &str, resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    markup::protect_spans(
        text,
        span_regex(),
        |caps: &Captures<'_>| match (caps.get(1), caps.get(2)) {
            (Some(code), _) => markup::preformatted(&unescape(code.as_str())),
            (None, Some(angle)) => decode_angle(angle.as_str(), &resolve),
            (None, None) => caps[0].to_string(),
        },
        |rest| {
            let mut out = rest.to_string();
            for (re, tag) in inline_regexes() {
                out = re
                    .replace_all(&out, |caps: &Captures<'_>| markup::encode(*tag, &caps[1]))
                    .into_owned();
            }
            unescape(&out)
        },
    )
}

/// Decode one `<…>` control sequence.
fn decode_angle<F>(inner: &str, resolve: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let (target, label) = match inner.split_once('|') {
        Some((target, label)) => (target, Some(label)),
        None => (inner, None),
    };

    if let Some(id) = target.strip_prefix('@') {
        let name = resolve(id)
            .or_else(|| label.map(str::to_string))
            .unwrap_or_else(|| id.to_string());
        markup::mention(&name)
    } else if let Some(id) = target.strip_prefix('#') {
        format!("#{}", label.unwrap_or(id))
    } else if let Some(special) = target.strip_prefix('!') {
        format!("@{}", label.unwrap_or(special))
    } else {
        unescape(target)
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_users(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_message_event_basic() {
        let event = json!({
            "type": "message",
            "user": "U456",
            "channel": "C789",
            "text": "Hello agent!",
            "ts": "1700000000.000100"
        });

        let parsed = parse_message_event(&event, Some("B123")).unwrap();
        assert_eq!(
            parsed,
            InboundEvent {
                channel: "C789",
                user: "U456",
                text: "Hello agent!",
                edited: false,
            }
        );
    }

    #[test]
    fn test_parse_message_event_filters_bot() {
        let event = json!({
            "type": "message",
            "user": "U456",
            "channel": "C789",
            "text": "Bot message",
            "bot_id": "B999"
        });
        assert!(parse_message_event(&event, None).is_none());
    }

    #[test]
    fn test_parse_message_event_filters_own_user() {
        let event = json!({
            "type": "message",
            "user": "U123",
            "channel": "C789",
            "text": "My own message"
        });
        assert!(parse_message_event(&event, Some("U123")).is_none());
    }

    #[test]
    fn test_parse_message_event_skips_other_subtypes() {
        let event = json!({
            "type": "message",
            "subtype": "channel_join",
            "user": "U456",
            "channel": "C789",
            "text": "joined"
        });
        assert!(parse_message_event(&event, None).is_none());
    }

    #[test]
    fn test_parse_message_event_message_changed() {
        let event = json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C789",
            "message": {
                "user": "U456",
                "text": "Edited message text",
                "ts": "1700000000.000100"
            }
        });

        let parsed = parse_message_event(&event, None).unwrap();
        assert!(parsed.edited);
        assert_eq!(parsed.text, "Edited message text");
        assert_eq!(parsed.channel, "C789");
    }

    #[test]
    fn test_decode_formatting() {
        let text = decode("*bold* _it_ ~gone~ ```let *x* = 1;```", no_users);
        assert_eq!(
            text,
            format!(
                "{} {} {} {}",
                markup::bold("bold"),
                markup::italic("it"),
                markup::strikethrough("gone"),
                markup::preformatted("let *x* = 1;")
            )
        );
    }

    #[test]
    fn test_decode_mentions_links_and_entities() {
        let resolve = |id: &str| (id == "U1").then(|| "Alice Smith".to_string());
        let text = decode(
            "hi <@U1>, <@U2|bob> see <https://example.com/a_b_c|docs> &amp; <#C9|general> &lt;3",
            resolve,
        );
        assert_eq!(
            text,
            format!(
                "hi {}, {} see https://example.com/a_b_c & #general <3",
                markup::mention("Alice Smith"),
                markup::mention("bob")
            )
        );
    }

    #[test]
    fn test_mentioned_users() {
        assert_eq!(
            mentioned_users("<@U1> and <@U2|bob> and <https://x.io>"),
            vec!["U1".to_string(), "U2".to_string()]
        );
    }

    #[test]
    fn test_render_to_mrkdwn() {
        let text = format!(
            "{} {} {}",
            markup::quote(&markup::bold("yes"), "Bob"),
            markup::mention("Alice"),
            markup::edit("fixed")
        );
        let msg = Message::new("telegram", "1", "Carol", text);
        assert_eq!(
            markup::render_message(&msg, &SLACK_DIALECT),
            "*[Carol]* Quote from Bob:\n*yes*\n\n @Alice Edit: fixed"
        );
    }

    #[test]
    fn test_render_decode_round_trip() {
        let native = "*bold* and _italic_ and ~strike~ ```code *here*```";
        let canonical = decode(native, no_users);
        assert_eq!(markup::render(&canonical, &SLACK_DIALECT), native);
    }

    #[test]
    fn test_render_escapes_control_sequences() {
        let msg = Message::new(
            "telegram",
            "1",
            "Eve <3",
            format!(
                "<!channel> a &lt; b <http://evil.example|bank> {}",
                markup::mention("Alice")
            ),
        );
        assert_eq!(
            markup::render_message(&msg, &SLACK_DIALECT),
            "*[Eve &lt;3]* &lt;!channel&gt; a &amp;lt; b \
             &lt;http://evil.example|bank&gt; @Alice"
        );
    }

    #[test]
    fn test_render_decode_round_trip_with_entities() {
        let native = "a &lt;b&gt; &amp; c *x &gt; y* ```if a &lt; b &amp;&amp; c {}```";
        let canonical = decode(native, no_users);
        assert_eq!(
            canonical,
            format!(
                "a <b> & c {} {}",
                markup::bold("x > y"),
                markup::preformatted("if a < b && c {}")
            )
        );
        assert_eq!(markup::render(&canonical, &SLACK_DIALECT), native);
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(
            display_name(&json!({"real_name": "Alice", "name": "alice"})),
            Some("Alice".to_string())
        );
        assert_eq!(
            display_name(&json!({"real_name": "", "profile": {"display_name": "Al"}, "name": "alice"})),
            Some("Al".to_string())
        );
        assert_eq!(display_name(&json!({})), None);
    }

    #[test]
    fn test_token_matches() {
        let backend = SlackBackend::new("xoxb-test".to_string(), "verify".to_string());
        assert!(backend.inner.token_matches("verify"));
        assert!(!backend.inner.token_matches("verifx"));
        assert!(!backend.inner.token_matches(""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_user_cache_shared_across_tasks() {
        const TASKS: usize = 16;
        let backend = SlackBackend::new("xoxb-test".to_string(), "verify".to_string());
        let everyone: String = (0..TASKS).map(|i| format!("<@U{i}> ")).collect();

        let handles: Vec<_> = (0..TASKS)
            .map(|i| {
                let inner = backend.inner.clone();
                let everyone = everyone.clone();
                tokio::spawn(async move {
                    inner.users.insert(format!("U{i}"), format!("User {i}"));
                    let own = inner.decode_text(&format!("hi <@U{i}>")).await;
                    assert_eq!(own, format!("hi {}", markup::mention(&format!("User {i}"))));

                    // Other tasks may or may not have filled their entry yet.
                    let all = decode(&everyone, |id| inner.users.get(id).map(|n| n.value().clone()));
                    for j in 0..TASKS {
                        let resolved = markup::mention(&format!("User {j}"));
                        let pending = markup::mention(&format!("U{j}"));
                        assert!(all.contains(&resolved) || all.contains(&pending));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.inner.users.len(), TASKS);
        for i in 0..TASKS {
            assert_eq!(
                backend.inner.users.get(&format!("U{i}")).unwrap().value(),
                &format!("User {i}")
            );
        }
    }

    #[test]
    fn test_events_taken_once() {
        let backend = SlackBackend::new("xoxb-test".to_string(), "verify".to_string());
        assert!(backend.events().is_ok());
        assert!(matches!(
            backend.events(),
            Err(BackendError::EventsTaken(_))
        ));
    }
}
