use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

use crate::api::ApiSurface;
use crate::error::{CallError, EngineError, ProtocolError};
use crate::events::{lock, Direction, EventDispatcher, SubscriptionId};
use crate::logging::{ClientOptions, LogOptions, TrafficLog};
use crate::message::{encode, Notification, Request, RpcError};
use crate::transport::Channel;

type PendingTx = oneshot::Sender<Result<Value, RpcError>>;

/// JSON-RPC client bound to one [`Channel`] for its whole lifetime.
///
/// Cloning is cheap; clones share the same id counter, pending calls and
/// subscriptions.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel: Arc<dyn Channel>,
    pending: DashMap<u64, PendingTx>,
    next_id: AtomicU64,
    outbound: Mutex<Outbound>,
    events: EventDispatcher,
    log: TrafficLog,
}

/// Messages not yet handed to the channel. `flushing` marks that some caller
/// is already draining the queue, so concurrent and re-entrant sends only
/// enqueue and FIFO order is kept without holding the lock during `send`.
#[derive(Default)]
struct Outbound {
    connected: bool,
    flushing: bool,
    queue: VecDeque<String>,
}

impl Client {
    /// Bind a client to `channel` and subscribe to its "open" and "message"
    /// events. Fails with [`EngineError::InvalidArgument`] if the channel is absent.
    pub fn new(
        channel: Option<Arc<dyn Channel>>,
        options: ClientOptions,
    ) -> Result<Self, EngineError> {
        let channel = channel.ok_or(EngineError::InvalidArgument("channel"))?;

        let inner = Arc::new(ClientInner {
            channel: channel.clone(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            outbound: Mutex::new(Outbound::default()),
            events: EventDispatcher::new(),
            log: TrafficLog::new("Client", options),
        });

        let weak = Arc::downgrade(&inner);
        channel.on_open(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_open();
            }
        }));

        let weak = Arc::downgrade(&inner);
        channel.on_message(Arc::new(move |message: String| {
            if let Some(inner) = weak.upgrade() {
                inner.process_message(&message);
            }
        }));

        Ok(Self { inner })
    }

    /// Issue a request. The id is assigned and the request queued before this
    /// returns; the future settles once, when the matching response arrives.
    ///
    /// There is no timeout: a request the peer never answers stays pending.
    pub fn call(&self, method: impl Into<String>, params: Option<Value>) -> ResponseFuture {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request {
            id,
            method: method.into(),
            params,
        };

        let text = match encode(&request) {
            Ok(text) => text,
            Err(e) => return ResponseFuture::failed(id, CallError::Encode(e)),
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        debug!(id, method = %request.method, "Issuing request");
        self.inner.send(text);

        ResponseFuture {
            id,
            state: ResponseState::Waiting(rx),
        }
    }

    /// Typed variant of [`Client::call`]: serializes `params` (a unit or
    /// `null` value means no params) and decodes the result into `R`.
    pub fn call_as<R: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: impl Serialize,
    ) -> impl Future<Output = Result<R, CallError>> {
        let response = serde_json::to_value(params)
            .map(|params| self.call(method, (!params.is_null()).then_some(params)));
        async move {
            let value = response.map_err(CallError::Encode)?.await?;
            serde_json::from_value(value).map_err(CallError::Decode)
        }
    }

    /// Send a notification. Nothing is awaited.
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) {
        let notification = Notification {
            method: method.into(),
            params,
        };
        match encode(&notification) {
            Ok(text) => self.inner.send(text),
            Err(e) => tracing::warn!(?e, method = %notification.method, "Failed to encode notification"),
        }
    }

    /// Feed one inbound frame through the client. Problems are reported to
    /// [`Client::on_error`] subscribers; this never panics or returns an error.
    pub fn process_message(&self, raw: &str) {
        self.inner.process_message(raw);
    }

    /// Subscribe to notifications named `event`.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe(event, Arc::new(handler))
    }

    /// Subscribe to protocol errors.
    pub fn on_error(
        &self,
        handler: impl Fn(&ProtocolError) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe_errors(Arc::new(handler))
    }

    /// Subscribe to sent/received messages. Only fires with `log_to_events`.
    pub fn on_traffic(
        &self,
        handler: impl Fn(Direction, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe_traffic(Arc::new(handler))
    }

    /// Remove any subscription made on this client.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn set_logging(&self, options: LogOptions) {
        self.inner.log.set(options);
    }

    pub fn logging(&self) -> LogOptions {
        self.inner.log.options()
    }

    /// Whether the channel has signalled "open".
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.outbound).connected
    }

    /// Messages waiting for the channel to open.
    pub fn queued(&self) -> usize {
        lock(&self.inner.outbound).queue.len()
    }

    /// Requests still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Root API surface: the first name accessed becomes the domain.
    pub fn api(&self) -> Arc<ApiSurface> {
        ApiSurface::for_client(self.clone(), None)
    }

    /// API surface with an explicit prefix; `""` gives an unprefixed surface.
    pub fn api_with_prefix(&self, prefix: &str) -> Arc<ApiSurface> {
        ApiSurface::for_client(self.clone(), Some(prefix.to_string()))
    }
}

impl ClientInner {
    fn handle_open(&self) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.connected = true;
            if outbound.flushing {
                return;
            }
            outbound.flushing = true;
            debug!(queued = outbound.queue.len(), "Channel open, flushing queue");
        }
        self.flush();
    }

    fn send(&self, message: String) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.queue.push_back(message);
            if !outbound.connected || outbound.flushing {
                return;
            }
            outbound.flushing = true;
        }
        self.flush();
    }

    fn flush(&self) {
        loop {
            let message = {
                let mut outbound = lock(&self.outbound);
                match outbound.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        outbound.flushing = false;
                        return;
                    }
                }
            };
            self.log.record(Direction::Send, &message, &self.events);
            if let Err(e) = self.channel.send(message) {
                self.events.emit_error(&ProtocolError::Transport(e));
            }
        }
    }

    fn process_message(&self, raw: &str) {
        self.log.record(Direction::Receive, raw, &self.events);
        if let Err(error) = self.route(raw) {
            self.events.emit_error(&error);
        }
    }

    fn route(&self, raw: &str) -> Result<(), ProtocolError> {
        if raw.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }

        let message: Value = serde_json::from_str(raw)?;
        if is_falsy(&message) {
            return Err(ProtocolError::Empty);
        }

        if let Some(id) = message.get("id").filter(|id| !is_falsy(id)) {
            let orphan = || ProtocolError::OrphanResponse { id: id.clone() };
            let key = id
                .as_u64()
                .filter(|key| self.pending.contains_key(key))
                .ok_or_else(orphan)?;

            let result = message.get("result");
            let error = message.get("error").filter(|e| !e.is_null());
            let outcome = match (result, error) {
                (Some(result), Some(_)) if !result.is_null() => {
                    return Err(ProtocolError::AmbiguousOutcome {
                        raw: raw.to_string(),
                    })
                }
                (Some(result), _) if !result.is_null() => Ok(result.clone()),
                (_, Some(error)) => Err(decode_error(error)),
                (Some(result), None) => Ok(result.clone()),
                (None, None) => {
                    return Err(ProtocolError::MissingOutcome {
                        raw: raw.to_string(),
                    })
                }
            };

            // A concurrent duplicate may have won the race since the lookup.
            let (_, tx) = self.pending.remove(&key).ok_or_else(orphan)?;
            debug!(id = key, ok = outcome.is_ok(), "Response received");
            // The caller may have dropped its future; nothing left to settle.
            let _ = tx.send(outcome);
            return Ok(());
        }

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            self.events.emit(method, message.get("params").cloned());
            return Ok(());
        }

        Err(ProtocolError::InvalidMessage {
            raw: raw.to_string(),
        })
    }
}

/// `null`, `false`, `0` and `""` carry no message or id.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn decode_error(error: &Value) -> RpcError {
    serde_json::from_value(error.clone()).unwrap_or_else(|_| {
        let message = match error.as_str() {
            Some(text) => text.to_string(),
            None => error.to_string(),
        };
        RpcError::new(0, message, Some(error.clone()))
    })
}

/// Future returned by [`Client::call`].
pub struct ResponseFuture {
    id: u64,
    state: ResponseState,
}

enum ResponseState {
    Waiting(oneshot::Receiver<Result<Value, RpcError>>),
    Failed(Option<CallError>),
}

impl ResponseFuture {
    fn failed(id: u64, error: CallError) -> Self {
        Self {
            id,
            state: ResponseState::Failed(Some(error)),
        }
    }

    /// The correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ResponseState::Waiting(rx) => Pin::new(rx).poll(cx).map(|outcome| match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error)) => Err(CallError::Rejected(error)),
                Err(_) => Err(CallError::Closed),
            }),
            ResponseState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(CallError::Closed)))
            }
        }
    }
}
