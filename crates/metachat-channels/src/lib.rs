//! Chat platform adapters and the relay router for Metachat.
//!
//! Each backend implements [`types::Backend`]; the [`bridge::Bridge`] merges
//! their inbound events and fans every message out to the other chats of
//! its room.

pub mod bridge;
pub mod markup;
pub mod registry;
pub mod slack;
pub mod telegram;
pub mod types;
pub mod webhook;
