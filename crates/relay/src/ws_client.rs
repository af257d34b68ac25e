use futures::{SinkExt, StreamExt};
use rpc_core::transport::{Channel, MessageCallback, OpenCallback};
use rpc_core::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outbound WebSocket [`Channel`].
///
/// [`WsChannel::connect`] returns immediately and dials in the background;
/// "open" fires once the handshake completes, so a client built on top queues
/// its first messages until then.
pub struct WsChannel {
    url: Url,
    sender: UnboundedSender<String>,
    open: AtomicBool,
    open_callbacks: Mutex<Vec<OpenCallback>>,
    message_callbacks: Mutex<Vec<MessageCallback>>,
    closed: CancellationToken,
}

impl WsChannel {
    /// Start connecting to `url`. Must be called inside a tokio runtime.
    pub fn connect(url: Url) -> Arc<Self> {
        let (sender, outbound) = unbounded_channel();
        let channel = Arc::new(Self {
            url: url.clone(),
            sender,
            open: AtomicBool::new(false),
            open_callbacks: Mutex::new(Vec::new()),
            message_callbacks: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(pump(
            url,
            Arc::downgrade(&channel),
            outbound,
            channel.closed.clone(),
        ));
        channel
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    /// Cancelled when the socket fails to connect or goes away.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let callbacks: Vec<OpenCallback> = self
            .open_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in &callbacks {
            callback();
        }
    }

    fn deliver(&self, text: &str) {
        let callbacks: Vec<MessageCallback> = self
            .message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in &callbacks {
            callback(text.to_string());
        }
    }
}

impl Channel for WsChannel {
    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.sender
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn on_open(&self, callback: OpenCallback) {
        self.open_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback.clone());
        if self.is_open() {
            callback();
        }
    }

    fn on_message(&self, callback: MessageCallback) {
        self.message_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

/// Owns the socket. Ends when the peer closes, the connection fails, or every
/// handle to the channel has been dropped and the outbound queue is drained.
async fn pump(
    url: Url,
    channel: Weak<WsChannel>,
    mut outbound: UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    let _guard = closed.drop_guard();

    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!(%url, error = %e, "WebSocket connect failed");
            return;
        }
    };
    tracing::debug!(%url, "WebSocket connected");

    let (mut sink, mut stream) = ws.split();
    match channel.upgrade() {
        Some(channel) => channel.mark_open(),
        None => return,
    }

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(text) = next else {
                    let _ = sink.close().await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(%url, error = %e, "WebSocket send failed");
                    break;
                }
            }
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!(%url, error = %e, "WebSocket read failed");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => match channel.upgrade() {
                        Some(channel) => channel.deliver(text.as_str()),
                        None => break,
                    },
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
        }
    }

    if let Some(channel) = channel.upgrade() {
        channel.open.store(false, Ordering::SeqCst);
    }
    tracing::debug!(%url, "WebSocket closed");
}
