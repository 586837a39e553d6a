//! Backend capability contract shared by every chat platform adapter.

use async_trait::async_trait;
use futures::Stream;
use metachat_types::message::Message;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Inbound messages observed by a backend, already in canonical markup.
pub type MessageStream = Pin<Box<dyn Stream<Item = Message> + Send>>;

/// Errors raised by backend adapters.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A payload could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The platform API rejected a call.
    #[error("{backend} API error: {reason}")]
    Api {
        /// Backend that made the call.
        backend: String,
        /// Platform-provided reason.
        reason: String,
    },

    /// Authentication failed or credentials were revoked.
    #[error("{backend} authentication failed: {reason}")]
    Auth {
        /// Backend that failed to authenticate.
        backend: String,
        /// Platform-provided reason.
        reason: String,
    },

    /// The chat identifier is not valid for this backend.
    #[error("invalid chat id for {backend}: {chat}")]
    InvalidChat {
        /// Backend that rejected the id.
        backend: String,
        /// The rejected id.
        chat: String,
    },

    /// `events()` was called more than once.
    #[error("event source of {0} was already taken")]
    EventsTaken(String),

    /// The backend stopped and can no longer deliver or receive.
    #[error("{0} backend closed")]
    Closed(String),
}

/// A pluggable chat platform.
///
/// The bridge depends only on this trait. Implementations must be safe to
/// share between the router's dispatch loop and the control surface: `send`
/// is called concurrently from both.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable name, used in `Message::backend` and as the webhook mount path.
    fn name(&self) -> &str;

    /// HTTP handler for inbound pushes, mounted under `/{name}`.
    ///
    /// `None` for backends that feed their event source themselves.
    fn webhook(&self) -> Option<axum::Router> {
        None
    }

    /// Begin background work (authentication, polling loops).
    ///
    /// May run for the lifetime of the process. Returns promptly when the
    /// backend has nothing to do in the background. An `Err` is fatal.
    async fn start(&self) -> Result<(), BackendError>;

    /// Take the inbound event source. Can only be called once.
    fn events(&self) -> Result<MessageStream, BackendError>;

    /// Deliver a canonical message to `chat_id`, rendering it to native syntax.
    async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError>;
}

/// Capacity of each backend's inbound queue.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// A backend's inbound queue: the sender side is fed by the adapter, the
/// receiver side is handed out once through [`Backend::events`].
pub struct EventQueue {
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// A sender feeding this queue.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Take the receiving side as a stream.
    ///
    /// Fails with [`BackendError::EventsTaken`] on every call after the first.
    pub fn take(&self, backend: &str) -> Result<MessageStream, BackendError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| BackendError::EventsTaken(backend.to_string()))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Push an inbound message into its backend's queue.
///
/// Fails with [`BackendError::Closed`] once the receiving side is gone.
pub async fn forward(tx: &mpsc::Sender<Message>, message: Message) -> Result<(), BackendError> {
    let backend = message.backend.clone();
    tx.send(message)
        .await
        .map_err(|_| BackendError::Closed(backend))
}

/// Split text into chunks of at most `max_len` bytes.
///
/// Prefers to break at a newline, then at a space, and never splits a
/// UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len || max_len == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len is smaller than the next character; take it whole.
            end = start
                + text[start..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .filter(|&pos| pos > 0)
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}
