use anyhow::anyhow;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::ApiSurface;
use crate::error::EngineError;
use crate::events::{Direction, EventDispatcher, SubscriptionId};
use crate::logging::{LogOptions, ServerOptions, TrafficLog};
use crate::message::{
    encode, error_response, success_response, ErrorCode, Notification, Response, RpcError,
    UNKNOWN_ID,
};
use crate::transport::{Acceptor, Channel};

pub(crate) type SyncMethod = Arc<dyn Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync>;
pub(crate) type AsyncMethod =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// An exposed method's handler.
#[derive(Clone)]
pub(crate) enum Method {
    Sync(SyncMethod),
    Async(AsyncMethod),
}

impl Method {
    pub(crate) fn sync<F>(handler: F) -> Self
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Method::Sync(Arc::new(handler))
    }

    pub(crate) fn deferred<F, Fut>(handler: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Method::Async(Arc::new(move |params| handler(params).boxed()))
    }
}

/// JSON-RPC server. Dispatches requests from every channel its acceptor hands
/// out and replies on the channel the request came from.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    acceptor: Arc<dyn Acceptor>,
    methods: DashMap<String, Method>,
    events: EventDispatcher,
    log: TrafficLog,
}

impl Server {
    /// Bind a server to `acceptor`. Fails with [`EngineError::InvalidArgument`]
    /// if the acceptor is absent.
    pub fn new(
        acceptor: Option<Arc<dyn Acceptor>>,
        options: ServerOptions,
    ) -> Result<Self, EngineError> {
        let acceptor = acceptor.ok_or(EngineError::InvalidArgument("acceptor"))?;

        let inner = Arc::new(ServerInner {
            acceptor: acceptor.clone(),
            methods: DashMap::new(),
            events: EventDispatcher::new(),
            log: TrafficLog::new("Server", options),
        });

        let weak = Arc::downgrade(&inner);
        acceptor.on_connection(Arc::new(move |channel: Arc<dyn Channel>| {
            debug!("Connection accepted");
            let server = weak.clone();
            let origin = Arc::downgrade(&channel);
            channel.on_message(Arc::new(move |message: String| {
                if let (Some(server), Some(origin)) = (server.upgrade(), origin.upgrade()) {
                    server.process_message(&message, &origin);
                }
            }));
        }));

        Ok(Self { inner })
    }

    /// Register a synchronous handler for `method`. A later registration under
    /// the same name replaces this one.
    ///
    /// A handler returning `Value::Null` is answered with `{}`.
    pub fn expose<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(method.into(), Method::sync(handler));
    }

    /// Register a handler whose result is produced by a future. Each call runs
    /// as its own task on the current tokio runtime and is answered when it
    /// completes, in whatever order that happens.
    pub fn expose_async<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(method.into(), Method::deferred(handler));
    }

    pub(crate) fn register(&self, method: String, handler: Method) {
        if self.inner.methods.insert(method.clone(), handler).is_some() {
            debug!(method, "Replaced exposed method");
        }
    }

    /// Names of every exposed method, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Handle one inbound frame from `origin`. Replies, if any, go to `origin`.
    pub fn process_message(&self, raw: &str, origin: &Arc<dyn Channel>) {
        self.inner.process_message(raw, origin);
    }

    /// Broadcast a notification to every channel currently connected.
    ///
    /// Fails with [`EngineError::CapabilityMissing`] if the acceptor cannot
    /// enumerate its channels.
    pub fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), EngineError> {
        let clients = self.inner.acceptor.clients().ok_or_else(|| {
            EngineError::CapabilityMissing(
                "Server does not support broadcasting: the acceptor cannot list its connected channels"
                    .into(),
            )
        })?;

        let notification = Notification {
            method: method.into(),
            params,
        };
        let text = match encode(&notification) {
            Ok(text) => text,
            Err(e) => {
                warn!(?e, method = %notification.method, "Failed to encode notification");
                return Ok(());
            }
        };

        debug!(method = %notification.method, clients = clients.len(), "Broadcasting");
        for client in &clients {
            self.inner.send(client, text.clone());
        }
        Ok(())
    }

    /// Subscribe to inbound notifications named `event`.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe(event, Arc::new(handler))
    }

    /// Subscribe to sent/received messages. Only fires with `log_to_events`.
    pub fn on_traffic(
        &self,
        handler: impl Fn(Direction, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.events.subscribe_traffic(Arc::new(handler))
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn set_logging(&self, options: LogOptions) {
        self.inner.log.set(options);
    }

    pub fn logging(&self) -> LogOptions {
        self.inner.log.options()
    }

    /// Root API surface: the first name accessed becomes the domain.
    pub fn api(&self) -> Arc<ApiSurface> {
        ApiSurface::for_server(self.clone(), None)
    }

    /// API surface with an explicit prefix; `""` gives an unprefixed surface.
    pub fn api_with_prefix(&self, prefix: &str) -> Arc<ApiSurface> {
        ApiSurface::for_server(self.clone(), Some(prefix.to_string()))
    }
}

impl ServerInner {
    fn process_message(self: &Arc<Self>, raw: &str, origin: &Arc<dyn Channel>) {
        self.log.record(Direction::Receive, raw, &self.events);

        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Unparseable message");
                self.reply(origin, failure(json!(UNKNOWN_ID), ErrorCode::ParseError, "", None));
                return;
            }
        };

        let id = message.get("id").filter(|id| !id.is_null()).cloned();
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            let id = id.unwrap_or(json!(UNKNOWN_ID));
            self.reply(origin, failure(id, ErrorCode::InvalidRequest, "", None));
            return;
        };
        let params = message.get("params").filter(|p| !p.is_null()).cloned();

        match id.filter(Value::is_number) {
            Some(id) => self.dispatch(id, method, params, origin),
            None => {
                self.events.emit(method, params);
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        id: Value,
        method: &str,
        params: Option<Value>,
        origin: &Arc<dyn Channel>,
    ) {
        let handler = self.methods.get(method).map(|entry| entry.value().clone());
        let Some(handler) = handler else {
            debug!(method, "Method not found");
            self.reply(origin, failure(id, ErrorCode::MethodNotFound, method, None));
            return;
        };

        match handler {
            Method::Sync(handler) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(params)))
                    .unwrap_or_else(|payload| Err(anyhow!(panic_message(&*payload))));
                self.reply(origin, outcome_response(id, method, outcome));
            }
            Method::Async(handler) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    let error = anyhow!("no tokio runtime available to run the handler");
                    self.reply(origin, outcome_response(id, method, Err(error)));
                    return;
                };
                let future = panic::catch_unwind(AssertUnwindSafe(|| handler(params)));
                let server = self.clone();
                let origin = origin.clone();
                let method = method.to_string();
                runtime.spawn(async move {
                    let outcome = match future {
                        Ok(future) => AssertUnwindSafe(future)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|payload| Err(anyhow!(panic_message(&*payload)))),
                        Err(payload) => Err(anyhow!(panic_message(&*payload))),
                    };
                    server.reply(&origin, outcome_response(id, &method, outcome));
                });
            }
        }
    }

    fn reply(&self, origin: &Arc<dyn Channel>, response: Response) {
        match encode(&response) {
            Ok(text) => self.send(origin, text),
            Err(e) => warn!(?e, "Failed to encode response"),
        }
    }

    fn send(&self, channel: &Arc<dyn Channel>, text: String) {
        self.log.record(Direction::Send, &text, &self.events);
        if let Err(e) = channel.send(text) {
            warn!(error = %e, "Failed to send to connection");
        }
    }
}

fn failure(id: Value, code: ErrorCode, method: &str, data: Option<Value>) -> Response {
    error_response(id, RpcError::from_code(code, method, data))
}

fn outcome_response(id: Value, method: &str, outcome: anyhow::Result<Value>) -> Response {
    match outcome {
        Ok(Value::Null) => success_response(id, json!({})),
        Ok(result) => success_response(id, result),
        Err(e) => {
            warn!(method, error = %e, "Exposed method failed");
            let data = Some(Value::String(e.to_string()));
            failure(id, ErrorCode::InternalError, method, data)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::logging::ClientOptions;
    use crate::transport::memory::{MemoryAcceptor, MemoryChannel};
    use std::sync::Mutex;
    use std::time::Duration;

    fn server_on(acceptor: &Arc<MemoryAcceptor>) -> Server {
        Server::new(
            Some(acceptor.clone() as Arc<dyn Acceptor>),
            ServerOptions::default(),
        )
        .unwrap()
    }

    async fn wait_for_replies(channel: &MemoryChannel, count: usize) -> Vec<String> {
        for _ in 0..200 {
            if channel.sent().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        channel.sent()
    }

    #[test]
    fn fails_on_missing_acceptor() {
        let err = Server::new(None, ServerOptions::default()).err();
        assert_eq!(err, Some(EngineError::InvalidArgument("acceptor")));
    }

    #[test]
    fn replies_to_unparseable_json_with_parse_error() {
        let acceptor = MemoryAcceptor::new();
        let _server = server_on(&acceptor);
        let channel = acceptor.connect();

        channel.receive("{badJson:true}");

        assert_eq!(
            channel.sent(),
            vec![r#"{"id":-1,"error":{"code":-32700,"message":"ParseError: invalid JSON received"}}"#.to_string()]
        );
    }

    #[test]
    fn replies_to_missing_method_with_invalid_request() {
        let acceptor = MemoryAcceptor::new();
        let _server = server_on(&acceptor);
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"params":{}}"#);
        channel.receive(r#"{"params":{}}"#);
        channel.receive("5");

        assert_eq!(
            channel.sent(),
            vec![
                r#"{"id":1,"error":{"code":-32600,"message":"InvalidRequest: JSON sent is not a valid request object"}}"#.to_string(),
                r#"{"id":-1,"error":{"code":-32600,"message":"InvalidRequest: JSON sent is not a valid request object"}}"#.to_string(),
                r#"{"id":-1,"error":{"code":-32600,"message":"InvalidRequest: JSON sent is not a valid request object"}}"#.to_string(),
            ]
        );
    }

    #[test]
    fn replies_to_unknown_method_with_method_not_found() {
        let acceptor = MemoryAcceptor::new();
        let _server = server_on(&acceptor);
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"yo"}"#);

        assert_eq!(
            channel.last_sent().unwrap(),
            r#"{"id":1,"error":{"code":-32601,"message":"MethodNotFound: 'yo' wasn't found"}}"#
        );

        let reply: Value = serde_json::from_str(&channel.last_sent().unwrap()).unwrap();
        let error = reply["error"].as_object().unwrap();
        assert_eq!(error["code"], json!(-32601));
        assert!(!error.contains_key("data"));
    }

    #[test]
    fn replies_with_handler_result() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("help", |params: Option<Value>| {
            assert_eq!(params, Some(json!({"lives": 1})));
            Ok(json!({"acknowledged": true}))
        });
        server.expose("silent", |_: Option<Value>| Ok(Value::Null));
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"help","params":{"lives":1}}"#);
        channel.receive(r#"{"id":2,"method":"silent"}"#);

        assert_eq!(
            channel.sent(),
            vec![
                r#"{"id":1,"result":{"acknowledged":true}}"#.to_string(),
                r#"{"id":2,"result":{}}"#.to_string(),
            ]
        );
    }

    #[test]
    fn handler_failure_becomes_internal_error() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("help", |_: Option<Value>| Err(anyhow!("Server made a boo boo")));
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"help"}"#);

        assert_eq!(
            channel.last_sent().unwrap(),
            r#"{"id":1,"error":{"code":-32603,"message":"InternalError: Internal Error when calling 'help'","data":"Server made a boo boo"}}"#
        );
    }

    #[test]
    fn handler_panic_becomes_internal_error() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("explode", |_: Option<Value>| -> anyhow::Result<Value> {
            panic!("kaboom")
        });
        let channel = acceptor.connect();

        channel.receive(r#"{"id":4,"method":"explode"}"#);

        assert_eq!(
            channel.last_sent().unwrap(),
            r#"{"id":4,"error":{"code":-32603,"message":"InternalError: Internal Error when calling 'explode'","data":"kaboom"}}"#
        );
    }

    #[test]
    fn last_registration_wins() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("version", |_: Option<Value>| Ok(json!(1)));
        server.expose("version", |_: Option<Value>| Ok(json!(2)));
        server.expose("alpha", |_: Option<Value>| Ok(Value::Null));
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"version"}"#);

        assert_eq!(channel.last_sent().unwrap(), r#"{"id":1,"result":2}"#);
        assert_eq!(server.methods(), vec!["alpha".to_string(), "version".to_string()]);
    }

    #[test]
    fn notifications_are_emitted_and_never_answered() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        server.on("dying", move |params| seen_clone.lock().unwrap().push(params));
        let channel = acceptor.connect();

        channel.receive(r#"{"method":"dying","params":{"health":10}}"#);
        channel.receive(r#"{"id":"abc","method":"dying"}"#);

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({"health": 10})), None]);
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn replies_only_to_the_originating_channel() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("whoami", |_: Option<Value>| Ok(json!("you")));
        let first = acceptor.connect();
        let second = acceptor.connect();

        second.receive(r#"{"id":9,"method":"whoami"}"#);

        assert!(first.sent().is_empty());
        assert_eq!(second.sent(), vec![r#"{"id":9,"result":"you"}"#.to_string()]);
    }

    #[tokio::test]
    async fn deferred_results_reply_in_completion_order() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose_async("slow", |_: Option<Value>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(json!("slow"))
        });
        server.expose_async("fast", |_: Option<Value>| async { Ok(json!("fast")) });
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"slow"}"#);
        channel.receive(r#"{"id":2,"method":"fast"}"#);

        assert_eq!(
            wait_for_replies(&channel, 2).await,
            vec![
                r#"{"id":2,"result":"fast"}"#.to_string(),
                r#"{"id":1,"result":"slow"}"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn rejected_deferred_result_becomes_internal_error() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose_async("help", |_: Option<Value>| async {
            Err(anyhow!("Server made a boo boo"))
        });
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"help"}"#);

        assert_eq!(
            wait_for_replies(&channel, 1).await,
            vec![r#"{"id":1,"error":{"code":-32603,"message":"InternalError: Internal Error when calling 'help'","data":"Server made a boo boo"}}"#.to_string()]
        );
    }

    #[test]
    fn deferred_handler_without_runtime_is_an_internal_error() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose_async("later", |_: Option<Value>| async { Ok(json!(1)) });
        let channel = acceptor.connect();

        channel.receive(r#"{"id":3,"method":"later"}"#);

        let reply: Value = serde_json::from_str(&channel.last_sent().unwrap()).unwrap();
        assert_eq!(reply["id"], json!(3));
        assert_eq!(reply["error"]["code"], json!(-32603));
    }

    #[test]
    fn broadcasts_to_connected_channels_only() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        let staying = acceptor.connect();
        let leaving = acceptor.connect();
        acceptor.disconnect(&leaving);

        server.notify("dying", Some(json!({"health": 10}))).unwrap();

        assert_eq!(
            staying.sent(),
            vec![r#"{"method":"dying","params":{"health":10}}"#.to_string()]
        );
        assert!(leaving.sent().is_empty());
    }

    #[test]
    fn broadcast_requires_enumeration() {
        let acceptor = MemoryAcceptor::without_enumeration();
        let server = server_on(&acceptor);
        let channel = acceptor.connect();

        let err = server.notify("dying", None).unwrap_err();

        assert!(matches!(err, EngineError::CapabilityMissing(_)));
        assert!(err.to_string().contains("does not support broadcasting"));
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn logs_traffic_to_events() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.set_logging(LogOptions {
            log_to_events: true,
            log_to_console: false,
        });
        assert!(server.logging().log_to_events);
        assert!(!server.logging().log_to_console);
        let traffic = Arc::new(Mutex::new(Vec::new()));
        let traffic_clone = traffic.clone();
        server.on_traffic(move |dir: Direction, msg: &str| {
            traffic_clone.lock().unwrap().push((dir, msg.to_string()))
        });
        let channel = acceptor.connect();

        channel.receive(r#"{"id":1,"method":"nope"}"#);

        let traffic = traffic.lock().unwrap();
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic[0], (Direction::Receive, r#"{"id":1,"method":"nope"}"#.to_string()));
        assert_eq!(traffic[1].0, Direction::Send);
    }

    #[tokio::test]
    async fn client_and_server_round_trip() {
        let acceptor = MemoryAcceptor::new();
        let server = server_on(&acceptor);
        server.expose("help", |_: Option<Value>| Ok(json!({"acknowledged": true})));
        let channel = acceptor.connect_pair();
        let client = Client::new(
            Some(channel.clone() as Arc<dyn Channel>),
            ClientOptions::default(),
        )
        .unwrap();

        let result = client.call("help", Some(json!({"lives": 1}))).await.unwrap();

        assert_eq!(result, json!({"acknowledged": true}));
        assert_eq!(
            channel.sent(),
            vec![r#"{"id":1,"method":"help","params":{"lives":1}}"#.to_string()]
        );
    }
}
