//! Platform-independent message, chat and room types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A platform-independent relay unit.
///
/// `text` always carries canonical markup, never a platform's native
/// syntax. Backends produce it on receipt and render it on send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Name of the originating backend.
    #[serde(default)]
    pub backend: String,
    /// Backend-specific chat identifier.
    #[serde(default)]
    pub chat: String,
    /// Display name of the sender; empty for system or injected messages.
    #[serde(default)]
    pub author: String,
    /// Message body in canonical markup.
    pub text: String,
}

impl Message {
    /// Create a message observed on `backend` in `chat`.
    pub fn new(
        backend: impl Into<String>,
        chat: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            chat: chat.into(),
            author: author.into(),
            text: text.into(),
        }
    }

    /// Whether this message was sent from the given chat.
    ///
    /// Backend names are compared after normalization.
    pub fn is_from(&self, chat: &Chat) -> bool {
        self.chat == chat.id && normalize_name(&self.backend) == normalize_name(&chat.backend)
    }
}

/// One conversation on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chat {
    /// Backend name (`messenger` is accepted as an alias).
    #[serde(alias = "messenger")]
    pub backend: String,
    /// Backend-specific chat identifier.
    pub id: String,
}

impl Chat {
    /// Create a chat reference.
    ///
    /// ```
    /// use metachat_types::message::Chat;
    ///
    /// let chat = Chat::new("telegram", "-100123");
    /// assert_eq!(chat.to_string(), "telegram:-100123");
    /// ```
    pub fn new(backend: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Chat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

/// A named set of chats relayed to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Room name; matched after [`normalize_name`].
    pub name: String,
    /// Member chats, each on a registered backend.
    #[serde(default)]
    pub chats: Vec<Chat>,
}

/// Normalize a backend or room name for lookups and URL paths.
///
/// Lower-cases the name and replaces spaces with hyphens.
pub fn normalize_name(name: &str) -> String {
    name.replace(' ', "-").to_lowercase()
}
