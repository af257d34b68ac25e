//! Capabilities the engines require from a transport.
//!
//! The engines never open sockets themselves. Anything that can move UTF-8
//! text frames one-to-one (WebSocket, pipe, in-process queue) can back a
//! [`crate::Client`] by implementing [`Channel`]; anything that hands out such
//! channels can back a [`crate::Server`] by implementing [`Acceptor`].

pub mod memory;

use std::sync::Arc;

use crate::error::TransportError;

pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(Arc<dyn Channel>) + Send + Sync>;

/// A one-to-one message channel.
pub trait Channel: Send + Sync {
    /// Send one frame. Must not block.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Subscribe to the "open" event. If the channel is already open the
    /// callback is invoked immediately.
    fn on_open(&self, callback: OpenCallback);

    /// Subscribe to inbound frames.
    fn on_message(&self, callback: MessageCallback);
}

/// Source of inbound channels for a server.
pub trait Acceptor: Send + Sync {
    /// Subscribe to newly accepted channels.
    fn on_connection(&self, callback: ConnectionCallback);

    /// The channels connected right now, or `None` if this acceptor cannot
    /// enumerate them. Broadcast depends on this.
    fn clients(&self) -> Option<Vec<Arc<dyn Channel>>> {
        None
    }
}
