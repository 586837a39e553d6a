//! Route handlers for the control surface.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use metachat_channels::bridge::BridgeHandle;
use metachat_types::message::Message;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

/// Shared state for all routes.
pub type AppState = BridgeHandle;

/// Body of `POST /rooms/{room}`.
///
/// Any `author` field is accepted and ignored: injected messages are
/// always unattributed.
#[derive(Debug, Deserialize)]
pub struct RoomPost {
    pub text: String,
}

/// GET /health: liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// POST /rooms/{room}: send a message to every chat in a room.
///
/// Targets are sent to in order; the first failure answers 500 and the
/// remaining targets are not attempted.
pub async fn post_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
    body: String,
) -> impl IntoResponse {
    let Some(room) = state.registry().lookup_by_name(&room) else {
        return (StatusCode::NOT_FOUND, Json(json!({}))).into_response();
    };

    let post: RoomPost = match serde_json::from_str(&body) {
        Ok(post) => post,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };

    let message = Message {
        text: post.text,
        ..Default::default()
    };
    for chat in &room.chats {
        if let Err(e) = state.deliver(&message, chat).await {
            error!(room = %room.name, chat = %chat, error = %e, "Manual post failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    }

    info!(room = %room.name, chats = room.chats.len(), "Manual post delivered");
    (StatusCode::OK, Json(json!({}))).into_response()
}
