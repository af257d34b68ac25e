use serde_json::Value;
use thiserror::Error;

use crate::message::RpcError;

/// Failures raised synchronously to the caller of an engine operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A required argument was absent.
    #[error("{0} cannot be undefined or null")]
    InvalidArgument(&'static str),

    /// The transport lacks a capability the operation depends on.
    #[error("{0}")]
    CapabilityMissing(String),
}

/// Protocol problems observed by a client. These never escape
/// `process_message`; they are delivered to `on_error` subscribers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{0}")]
    Parse(#[from] serde_json::Error),

    #[error("Message cannot be null, empty or undefined")]
    Empty,

    #[error("Response with id:{id} has no pending request")]
    OrphanResponse { id: Value },

    #[error("Response must have result or error: {raw}")]
    MissingOutcome { raw: String },

    #[error("Response cannot have both result and error: {raw}")]
    AmbiguousOutcome { raw: String },

    #[error("Invalid message: {raw}")]
    InvalidMessage { raw: String },

    #[error("Failed to send message: {0}")]
    Transport(#[from] TransportError),
}

/// How an outbound call settles when it does not produce a result.
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer answered with an `error` object.
    #[error(transparent)]
    Rejected(RpcError),

    /// The client was dropped before a response arrived.
    #[error("client closed before a response arrived")]
    Closed,

    #[error("failed to encode params: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// The peer's error object, if the call was rejected by the peer.
    pub fn rpc_error(&self) -> Option<&RpcError> {
        match self {
            CallError::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

/// Returned by [`crate::transport::Channel::send`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}
