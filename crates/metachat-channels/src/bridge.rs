//! Relay router: merges every backend's inbound events and fans each
//! message out to the other chats of its room.
//!
//! `Bridge` owns the running tasks; `BridgeState` is the immutable part
//! (backends and rooms) shared with the HTTP control surface.

use crate::registry::RoomRegistry;
use crate::types::{Backend, BackendError};
use futures::{Future, StreamExt};
use metachat_types::config::{BridgeConfig, SendFailurePolicy};
use metachat_types::error::MetachatError;
use metachat_types::message::{normalize_name, Chat, Message, Room};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// In-band command that makes the bridge reply with the chat's identifier.
pub const CHAT_ID_COMMAND: &str = "metachat chatID";

/// Capacity of the merged inbound queue.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// How long `run()` waits for each task after signalling shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcomes that stop the router.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid configuration, detected before anything starts.
    #[error(transparent)]
    Config(#[from] MetachatError),

    /// A backend failed to start or its background loop died.
    #[error("backend {backend} failed: {source}")]
    Lifecycle {
        backend: String,
        #[source]
        source: BackendError,
    },

    /// Delivery to a chat failed.
    #[error("failed to send to {backend}:{chat}: {source}")]
    Send {
        backend: String,
        chat: String,
        #[source]
        source: BackendError,
    },

    /// Delivery to a chat did not finish in time.
    #[error("sending to {backend}:{chat} timed out")]
    SendTimeout { backend: String, chat: String },

    /// A target chat names a backend that is not registered.
    #[error("backend '{0}' is not registered")]
    UnknownBackend(String),

    /// Every backend's event source has closed.
    #[error("all event sources closed")]
    SourcesClosed,

    /// The HTTP control surface stopped.
    #[error("control surface failed: {0}")]
    Surface(#[from] std::io::Error),
}

/// Backends and rooms, fixed for the lifetime of the bridge.
pub struct BridgeState {
    /// Normalized backend name -> backend.
    backends: HashMap<String, Arc<dyn Backend>>,
    registry: RoomRegistry,
    config: BridgeConfig,
}

/// Shared, read-only view of the bridge used by the control surface.
pub type BridgeHandle = Arc<BridgeState>;

impl BridgeState {
    /// Validate the backends and rooms.
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        rooms: &[Room],
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let mut by_name: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        for backend in backends {
            let key = normalize_name(backend.name());
            if by_name.contains_key(&key) {
                return Err(MetachatError::Config(format!(
                    "backend '{}' is registered twice",
                    backend.name()
                ))
                .into());
            }
            by_name.insert(key, backend);
        }

        let registry = RoomRegistry::build(rooms, by_name.keys().map(String::as_str))?;
        Ok(Self {
            backends: by_name,
            registry,
            config,
        })
    }

    /// Look up a backend by name (normalized before lookup).
    pub fn backend(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&normalize_name(name))
    }

    /// All registered backends.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Send `message` to one chat, bounded by the configured timeout.
    pub async fn deliver(&self, message: &Message, chat: &Chat) -> Result<(), BridgeError> {
        let backend = self
            .backend(&chat.backend)
            .ok_or_else(|| BridgeError::UnknownBackend(chat.backend.clone()))?;

        let send = backend.send(message, &chat.id);
        let result = match self.config.send_timeout_secs {
            0 => send.await,
            secs => match tokio::time::timeout(Duration::from_secs(secs), send).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(BridgeError::SendTimeout {
                        backend: chat.backend.clone(),
                        chat: chat.id.clone(),
                    })
                }
            },
        };

        result.map_err(|source| BridgeError::Send {
            backend: chat.backend.clone(),
            chat: chat.id.clone(),
            source,
        })
    }

    /// Handle one inbound message: answer the chat-id command or relay.
    pub async fn dispatch(&self, message: &Message) -> Result<(), BridgeError> {
        let origin = Chat::new(message.backend.clone(), message.chat.clone());

        if message.text == CHAT_ID_COMMAND {
            info!(backend = %message.backend, chat = %message.chat, "Answering chat id command");
            let reply = Message::new(
                message.backend.clone(),
                message.chat.clone(),
                "",
                message.chat.clone(),
            );
            let result = self.deliver(&reply, &origin).await;
            return self.apply_policy(result);
        }

        let targets = self.registry.targets_for(message);
        debug!(
            backend = %message.backend,
            chat = %message.chat,
            targets = targets.len(),
            "Relaying message"
        );
        for chat in &targets {
            let result = self.deliver(message, chat).await;
            self.apply_policy(result)?;
        }
        Ok(())
    }

    fn apply_policy(&self, result: Result<(), BridgeError>) -> Result<(), BridgeError> {
        match (result, self.config.on_send_failure) {
            (Ok(()), _) => Ok(()),
            (Err(e), SendFailurePolicy::Skip) => {
                error!(error = %e, "Relay failed, skipping target");
                Ok(())
            }
            (Err(e), SendFailurePolicy::Abort) => Err(e),
        }
    }
}

/// Requests a clean stop of a running bridge.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Signal every task to stop. `run()` then returns `Ok(())`.
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        wait_for_shutdown(&mut rx).await;
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone: nothing can trigger shutdown any more.
            futures::future::pending::<()>().await;
        }
    }
}

/// The relay router.
pub struct Bridge {
    state: BridgeHandle,
    errors_tx: mpsc::UnboundedSender<BridgeError>,
    errors_rx: mpsc::UnboundedReceiver<BridgeError>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Build a bridge over `backends`, validating `rooms` against them.
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        rooms: &[Room],
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let state = Arc::new(BridgeState::new(backends, rooms, config)?);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            state,
            errors_tx,
            errors_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            tasks: Vec::new(),
        })
    }

    /// Shared state for the control surface.
    pub fn handle(&self) -> BridgeHandle {
        self.state.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Run `task` alongside the router; an `Err` from it stops the router.
    pub fn supervise<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let name = name.into();
        let errors = self.errors_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!(task = %name, "Supervised task finished"),
                Err(e) => {
                    error!(task = %name, error = %e, "Supervised task failed");
                    let _ = errors.send(e);
                }
            }
        }));
    }

    /// Start every backend and relay messages until an error or shutdown.
    ///
    /// Returns `Ok(())` only after a shutdown was triggered.
    pub async fn run(mut self) -> Result<(), BridgeError> {
        let result = self.relay().await;

        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, task).await;
        }

        match &result {
            Ok(()) => info!("Bridge stopped"),
            Err(e) => error!(error = %e, "Bridge stopped"),
        }
        result
    }

    async fn relay(&mut self) -> Result<(), BridgeError> {
        info!(
            backends = self.state.backends.len(),
            rooms = self.state.registry.len(),
            "Starting bridge"
        );

        let (events_tx, mut events_rx) = mpsc::channel::<Message>(EVENT_QUEUE_CAPACITY);
        let backends: Vec<Arc<dyn Backend>> = self.state.backends().cloned().collect();

        for backend in &backends {
            let name = backend.name().to_string();
            let mut stream = backend
                .events()
                .map_err(|source| BridgeError::Lifecycle {
                    backend: name.clone(),
                    source,
                })?;
            let tx = events_tx.clone();
            let mut shutdown = self.shutdown_rx.clone();

            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        next = stream.next() => match next {
                            Some(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                warn!(backend = %name, "Event source closed");
                                break;
                            }
                        },
                        _ = wait_for_shutdown(&mut shutdown) => break,
                    }
                }
            }));
        }
        drop(events_tx);

        for backend in backends {
            let errors = self.errors_tx.clone();
            let mut shutdown = self.shutdown_rx.clone();

            self.tasks.push(tokio::spawn(async move {
                let name = backend.name().to_string();
                info!(backend = %name, "Starting backend");
                tokio::select! {
                    result = backend.start() => match result {
                        Ok(()) => debug!(backend = %name, "Backend start returned"),
                        Err(source) => {
                            error!(backend = %name, error = %source, "Backend failed");
                            let _ = errors.send(BridgeError::Lifecycle { backend: name, source });
                        }
                    },
                    _ = wait_for_shutdown(&mut shutdown) => {}
                }
            }));
        }

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                Some(e) = self.errors_rx.recv() => return Err(e),
                event = events_rx.recv() => match event {
                    Some(message) => self.state.dispatch(&message).await?,
                    None => return Err(BridgeError::SourcesClosed),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingBackend {
        name: String,
        fail: bool,
        delay: Option<Duration>,
        sent: Mutex<Vec<(String, Message)>>,
    }

    impl RecordingBackend {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                delay: None,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                delay: None,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                delay: Some(delay),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, Message)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn events(&self) -> Result<MessageStream, BackendError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send(&self, message: &Message, chat_id: &str) -> Result<(), BackendError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(BackendError::Api {
                    backend: self.name.clone(),
                    reason: "channel_not_found".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), message.clone()));
            Ok(())
        }
    }

    fn general(chats: &[(&str, &str)]) -> Vec<Room> {
        vec![Room {
            name: "general".to_string(),
            chats: chats.iter().map(|(b, id)| Chat::new(*b, *id)).collect(),
        }]
    }

    #[tokio::test]
    async fn test_dispatch_relays_to_other_chats() {
        let slack = RecordingBackend::new("slack");
        let telegram = RecordingBackend::new("telegram");
        let state = BridgeState::new(
            vec![slack.clone(), telegram.clone()],
            &general(&[("slack", "C1"), ("telegram", "T1")]),
            BridgeConfig::default(),
        )
        .unwrap();

        let msg = Message::new("slack", "C1", "Alice", "hello");
        state.dispatch(&msg).await.unwrap();

        assert!(slack.sent().is_empty());
        assert_eq!(telegram.sent(), vec![("T1".to_string(), msg)]);
    }

    #[tokio::test]
    async fn test_chat_id_command_replies_to_origin_only() {
        let slack = RecordingBackend::new("slack");
        let telegram = RecordingBackend::new("telegram");
        let state = BridgeState::new(
            vec![slack.clone(), telegram.clone()],
            &general(&[("slack", "C1"), ("telegram", "T1")]),
            BridgeConfig::default(),
        )
        .unwrap();

        let msg = Message::new("slack", "C1", "Alice", CHAT_ID_COMMAND);
        state.dispatch(&msg).await.unwrap();

        let sent = slack.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "C1");
        assert_eq!(sent[0].1.text, "C1");
        assert!(sent[0].1.author.is_empty());
        assert!(telegram.sent().is_empty());
    }

    #[tokio::test]
    async fn test_chat_id_command_works_outside_rooms() {
        let slack = RecordingBackend::new("slack");
        let state =
            BridgeState::new(vec![slack.clone()], &[], BridgeConfig::default()).unwrap();

        let msg = Message::new("slack", "C42", "Alice", CHAT_ID_COMMAND);
        state.dispatch(&msg).await.unwrap();
        assert_eq!(slack.sent()[0].1.text, "C42");
    }

    #[tokio::test]
    async fn test_abort_policy_stops_at_first_failure() {
        let slack = RecordingBackend::new("slack");
        let broken = RecordingBackend::failing("broken");
        let telegram = RecordingBackend::new("telegram");
        let state = BridgeState::new(
            vec![slack.clone(), broken.clone(), telegram.clone()],
            &general(&[("slack", "C1"), ("broken", "B1"), ("telegram", "T1")]),
            BridgeConfig::default(),
        )
        .unwrap();

        let err = state
            .dispatch(&Message::new("slack", "C1", "Alice", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Send { ref backend, .. } if backend == "broken"));
        assert!(telegram.sent().is_empty());
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let slack = RecordingBackend::new("slack");
        let broken = RecordingBackend::failing("broken");
        let telegram = RecordingBackend::new("telegram");
        let config = BridgeConfig {
            on_send_failure: SendFailurePolicy::Skip,
            ..Default::default()
        };
        let state = BridgeState::new(
            vec![slack.clone(), broken.clone(), telegram.clone()],
            &general(&[("slack", "C1"), ("broken", "B1"), ("telegram", "T1")]),
            config,
        )
        .unwrap();

        state
            .dispatch(&Message::new("slack", "C1", "Alice", "hi"))
            .await
            .unwrap();
        assert_eq!(telegram.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let slow = RecordingBackend::slow("slow", Duration::from_secs(60));
        let config = BridgeConfig {
            send_timeout_secs: 1,
            ..Default::default()
        };
        let state = BridgeState::new(vec![slow.clone()], &[], config).unwrap();

        let err = state
            .deliver(&Message::new("x", "y", "", "hi"), &Chat::new("slow", "S1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SendTimeout { .. }));
        assert!(slow.sent().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_unknown_backend() {
        let state = BridgeState::new(Vec::new(), &[], BridgeConfig::default()).unwrap();
        let err = state
            .deliver(&Message::new("x", "y", "", "hi"), &Chat::new("irc", "#a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownBackend(name) if name == "irc"));
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let result = BridgeState::new(
            vec![RecordingBackend::new("Slack"), RecordingBackend::new("slack")],
            &[],
            BridgeConfig::default(),
        );
        assert!(matches!(
            result,
            Err(BridgeError::Config(MetachatError::Config(_)))
        ));
    }

    #[test]
    fn test_unknown_room_backend_rejected() {
        let result = Bridge::new(
            vec![RecordingBackend::new("slack")],
            &general(&[("slack", "C1"), ("discord", "D1")]),
            BridgeConfig::default(),
        );
        let err = result.err().unwrap();
        let text = err.to_string();
        assert!(text.contains("discord"));
        assert!(text.contains("general"));
    }
}
