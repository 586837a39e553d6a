//! HTTP control surface: health check, manual room posts and the mount
//! point for backend webhooks.

pub mod routes;
pub mod server;
