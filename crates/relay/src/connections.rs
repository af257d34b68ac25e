use axum::extract::ws::Message;
use dashmap::DashMap;
use rpc_core::transport::{Channel, MessageCallback, OpenCallback};
use rpc_core::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{error::TrySendError, Sender};

/// One accepted WebSocket, seen by the engine as a [`Channel`].
///
/// Outbound frames go through a bounded queue drained by the socket's writer
/// task, so `send` never blocks.
pub struct WsConnection {
    id: String,
    sender: Sender<Message>,
    message_callbacks: Mutex<Vec<MessageCallback>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(sender: Sender<Message>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            sender,
            message_callbacks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hand an inbound text frame to the subscribers.
    pub fn deliver(&self, text: &str) {
        let callbacks: Vec<MessageCallback> = self
            .message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in &callbacks {
            callback(text.to_string());
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for WsConnection {
    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sender
            .try_send(Message::Text(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Other("outbound buffer is full".into()),
                TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// An accepted socket is open from the start.
    fn on_open(&self, callback: OpenCallback) {
        callback();
    }

    fn on_message(&self, callback: MessageCallback) {
        self.message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

/// Connections currently attached to a WebSocket acceptor, keyed by id.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<WsConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Track a connection, returning its id.
    pub fn register(&self, connection: Arc<WsConnection>) -> String {
        let id = connection.id().to_string();
        self.connections.insert(id.clone(), connection);
        id
    }

    /// Forget a connection. Returns true if it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the open connections.
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.value().clone() as Arc<dyn Channel>)
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
