//! Transport-agnostic JSON-RPC engine.
//!
//! [`Client`] correlates requests with responses over any [`Channel`] and
//! queues outbound traffic until the channel opens. [`Server`] dispatches
//! requests from every channel an [`Acceptor`] hands out and can broadcast
//! notifications. Both expose a convention-driven [`ApiSurface`]
//! (`api.Game.onLevelUp`, `api.Game.help`) through `api()`.
//!
//! No I/O happens in this crate; transports implement the traits in
//! [`transport`].

pub mod api;
pub mod client;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod server;
pub mod transport;

pub use api::{ApiSurface, Member, Module};
pub use client::{Client, ResponseFuture};
pub use error::{CallError, EngineError, ProtocolError, TransportError};
pub use events::{Direction, SubscriptionId};
pub use logging::{ClientOptions, LogOptions, ServerOptions};
pub use message::{ErrorCode, Notification, Request, Response, RpcError};
pub use server::Server;
pub use transport::{Acceptor, Channel};
