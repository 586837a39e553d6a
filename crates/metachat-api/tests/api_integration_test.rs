//! Control surface tests, driven through the router with `oneshot`.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use metachat_api::server::build_router;
use metachat_channels::bridge::BridgeState;
use metachat_channels::types::{Backend, BackendError, MessageStream};
use metachat_types::config::BridgeConfig;
use metachat_types::message::{Chat, Message, Room};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

struct MockBackend {
    name: String,
    fail: bool,
    sent: Mutex<Vec<(String, Message)>>,
}

impl MockBackend {
    fn new(name: &str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, Message)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn webhook(&self) -> Option<Router> {
        Some(
            Router::new()
                .route("/", post(|| async { "hooked" }))
                .route("/panic", get(|| async { panic!("handler bug") as () })),
        )
    }

    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn events(&self) -> Result<MessageStream, BackendError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError> {
        if self.fail {
            return Err(BackendError::Api {
                backend: self.name.clone(),
                reason: "not_in_channel".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), message.clone()));
        Ok(())
    }
}

fn app(backends: &[&Arc<MockBackend>], rooms: &[Room]) -> Router {
    let backends: Vec<Arc<dyn Backend>> = backends
        .iter()
        .map(|b| (*b).clone() as Arc<dyn Backend>)
        .collect();
    let state = BridgeState::new(backends, rooms, BridgeConfig::default()).unwrap();
    build_router(Arc::new(state))
}

fn general() -> Vec<Room> {
    vec![Room {
        name: "General Chat".to_string(),
        chats: vec![Chat::new("slack", "C1"), Chat::new("telegram", "T1")],
    }]
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let slack = MockBackend::new("slack", false);
    let resp = app(&[&slack], &[])
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!({ "status": "ok" }));
    assert!(slack.sent().is_empty());
}

#[tokio::test]
async fn test_manual_post_reaches_every_chat_unattributed() {
    let slack = MockBackend::new("slack", false);
    let telegram = MockBackend::new("telegram", false);
    let resp = app(&[&slack, &telegram], &general())
        .oneshot(post_json(
            "/rooms/general-chat",
            r#"{"text":"maintenance at 5","author":"mallory"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, serde_json::json!({}));

    let slack_sent = slack.sent();
    let telegram_sent = telegram.sent();
    assert_eq!(slack_sent.len(), 1);
    assert_eq!(telegram_sent.len(), 1);
    assert_eq!(slack_sent[0].0, "C1");
    assert_eq!(telegram_sent[0].0, "T1");
    for (_, msg) in slack_sent.iter().chain(telegram_sent.iter()) {
        assert_eq!(msg.text, "maintenance at 5");
        assert!(msg.author.is_empty());
    }
}

#[tokio::test]
async fn test_unknown_room_is_404_without_sends() {
    let slack = MockBackend::new("slack", false);
    let telegram = MockBackend::new("telegram", false);
    let resp = app(&[&slack, &telegram], &general())
        .oneshot(post_json("/rooms/nowhere", r#"{"text":"hi"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await, serde_json::json!({}));
    assert!(slack.sent().is_empty());
    assert!(telegram.sent().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let slack = MockBackend::new("slack", false);
    let telegram = MockBackend::new("telegram", false);
    let resp = app(&[&slack, &telegram], &general())
        .oneshot(post_json("/rooms/general-chat", r#"{"txt":"hi"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(resp).await["error"].is_string());
    assert!(slack.sent().is_empty());
}

#[tokio::test]
async fn test_send_failure_is_500() {
    let slack = MockBackend::new("slack", false);
    let telegram = MockBackend::new("telegram", true);
    let resp = app(&[&slack, &telegram], &general())
        .oneshot(post_json("/rooms/general-chat", r#"{"text":"hi"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("not_in_channel"));
    // Earlier targets are not retracted.
    assert_eq!(slack.sent().len(), 1);
}

#[tokio::test]
async fn test_webhook_nested_under_normalized_name() {
    let backend = MockBackend::new("Mock Chat", false);
    let resp = app(&[&backend], &[])
        .oneshot(post_json("/mock-chat", "{}"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"hooked");
}

#[tokio::test]
async fn test_handler_panic_is_caught() {
    let backend = MockBackend::new("mock", false);
    let resp = app(&[&backend], &[])
        .oneshot(Request::get("/mock/panic").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
