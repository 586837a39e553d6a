//! Shared error types for Metachat.

use thiserror::Error;

/// Configuration and validation errors.
///
/// Every variant is fatal: they are reported once at startup and the
/// bridge does not start.
#[derive(Error, Debug)]
pub enum MetachatError {
    /// The listening port was not configured.
    #[error("Configuration error: port must be set")]
    MissingPort,

    /// A room references a backend that is not registered.
    #[error("Configuration error: backend '{backend}' from room '{room}' not found")]
    UnknownBackend {
        /// Name of the offending room.
        room: String,
        /// Backend name as written in the room definition.
        backend: String,
    },

    /// A chat is listed in more than one room.
    #[error("Configuration error: chat {backend}:{chat} is listed in both room '{first}' and room '{second}'")]
    ChatInMultipleRooms {
        /// Backend of the chat.
        backend: String,
        /// Chat identifier.
        chat: String,
        /// Room that listed it first.
        first: String,
        /// Room that listed it again.
        second: String,
    },

    /// Two rooms normalize to the same name.
    #[error("Configuration error: duplicate room name '{0}'")]
    DuplicateRoom(String),

    /// A secret referenced by environment variable is missing or empty.
    #[error("Configuration error: {backend} requires env var {env_var} to be set")]
    MissingSecret {
        /// Backend that needs the secret.
        backend: String,
        /// Name of the environment variable.
        env_var: String,
    },

    /// Any other invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with MetachatError.
pub type MetachatResult<T> = Result<T, MetachatError>;
