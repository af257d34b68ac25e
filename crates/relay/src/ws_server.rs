use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use rpc_core::transport::{Acceptor, Channel, ConnectionCallback};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{net::TcpListener, sync::mpsc::channel};
use tokio_util::sync::CancellationToken;

use crate::connections::{ConnectionRegistry, WsConnection};

/// Acceptor backed by an axum WebSocket route. Every upgraded socket becomes a
/// [`WsConnection`] announced to `on_connection` subscribers.
pub struct WsAcceptor {
    connections: ConnectionRegistry,
    connection_callbacks: Mutex<Vec<ConnectionCallback>>,
    cancellation_token: CancellationToken,
}

impl WsAcceptor {
    pub fn new(cancellation_token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            connections: ConnectionRegistry::new(),
            connection_callbacks: Mutex::new(Vec::new()),
            cancellation_token,
        })
    }

    pub fn routes(self: &Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(handle_socket_upgrade))
            .with_state(self.clone())
    }

    /// Serve `path` on `listener` until the cancellation token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, path: &str) -> Result<()> {
        let token = self.cancellation_token.clone();
        let app = self.routes(path);

        tracing::info!("Starting WebSocket server...");
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                tracing::info!("Cancellation token triggered, starting graceful shutdown");
            })
            .await?;
        tracing::info!(
            connections = self.connection_count(),
            "WebSocket server stopped"
        );

        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn announce(&self, connection: Arc<dyn Channel>) {
        let callbacks: Vec<ConnectionCallback> = self
            .connection_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in &callbacks {
            callback(connection.clone());
        }
    }
}

impl Acceptor for WsAcceptor {
    fn on_connection(&self, callback: ConnectionCallback) {
        self.connection_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn clients(&self) -> Option<Vec<Arc<dyn Channel>>> {
        Some(self.connections.channels())
    }
}

async fn handle_socket_upgrade(
    ws: WebSocketUpgrade,
    State(acceptor): State<Arc<WsAcceptor>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, acceptor))
}

async fn handle_socket(socket: WebSocket, acceptor: Arc<WsAcceptor>) {
    let (mut sink, mut stream) = socket.split();
    let (send, mut recv) = channel(1024);

    tokio::spawn(async move {
        while let Some(msg) = recv.recv().await {
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(?e, "Socket writer stopped");
                break;
            }
        }
    });

    let connection = Arc::new(WsConnection::new(send));
    let id = acceptor.connections.register(connection.clone());
    tracing::info!(connection = %id, "Client connected");
    acceptor.announce(connection.clone());

    let cancellation_token = acceptor.cancellation_token.clone();
    loop {
        tokio::select! {
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_e)) => {
                        // Lost connections without a closing handshake land here.
                        continue;
                    }
                    Some(Ok(msg)) => {
                        tracing::debug!(?msg, "Ignoring non-text frame");
                        continue;
                    }
                };
                connection.deliver(&text);
            }
            _ = cancellation_token.cancelled() => {
                tracing::debug!("Closing connection due to server cancel...");
                break;
            }
        }
    }

    connection.close();
    acceptor.connections.remove(&id);
    tracing::info!(connection = %id, "Client disconnected");
    if acceptor.connections.is_empty() {
        tracing::debug!("No clients connected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws_client::WsChannel;
    use rpc_core::{Client, ClientOptions, Server, ServerOptions};
    use serde_json::{json, Value};
    use std::time::Duration;
    use url::Url;

    async fn start_server() -> (Url, Server, Arc<WsAcceptor>, CancellationToken) {
        let token = CancellationToken::new();
        let acceptor = WsAcceptor::new(token.clone());
        let server = Server::new(
            Some(acceptor.clone() as Arc<dyn Acceptor>),
            ServerOptions::default(),
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(acceptor.clone().serve(listener, "/rpc"));
        let url = Url::parse(&format!("ws://{}/rpc", addr)).unwrap();
        (url, server, acceptor, token)
    }

    fn client_for(url: &Url) -> (Client, Arc<WsChannel>) {
        let channel = WsChannel::connect(url.clone());
        let client = Client::new(
            Some(channel.clone() as Arc<dyn Channel>),
            ClientOptions::default(),
        )
        .unwrap();
        (client, channel)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn call_round_trips_over_websocket() {
        let (url, server, _acceptor, token) = start_server().await;
        server.expose("help", |_: Option<Value>| Ok(json!({"acknowledged": true})));
        let (client, _channel) = client_for(&url);

        // Issued before the handshake completes; sent once the socket opens.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            client.call("help", Some(json!({"lives": 1}))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result, json!({"acknowledged": true}));
        token.cancel();
    }

    #[tokio::test]
    async fn broadcast_reaches_connected_sockets() {
        let (url, server, acceptor, token) = start_server().await;
        let (client, channel) = client_for(&url);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        client.on("dying", move |params| seen_clone.lock().unwrap().push(params));

        wait_until(|| channel.is_open() && acceptor.connection_count() == 1).await;
        server.notify("dying", Some(json!({"health": 10}))).unwrap();
        wait_until(|| !seen.lock().unwrap().is_empty()).await;

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({"health": 10}))]);
        token.cancel();
    }

    #[tokio::test]
    async fn disconnected_sockets_leave_the_registry() {
        let (url, _server, acceptor, token) = start_server().await;
        let (client, channel) = client_for(&url);
        wait_until(|| acceptor.connection_count() == 1).await;
        assert_eq!(acceptor.clients().map(|c| c.len()), Some(1));

        let closed = channel.closed_token();
        drop(client);
        drop(channel);
        tokio::time::timeout(Duration::from_secs(5), closed.cancelled())
            .await
            .unwrap();
        wait_until(|| acceptor.connection_count() == 0).await;

        assert_eq!(acceptor.connection_count(), 0);
        token.cancel();
    }
}
