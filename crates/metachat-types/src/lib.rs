//! Core types for the Metachat chat bridge.
//!
//! This crate defines the shared data model (messages, chats, rooms), the
//! configuration schema and the configuration error taxonomy used by every
//! other Metachat crate. It contains no business logic.

pub mod config;
pub mod error;
pub mod message;
