use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Id sent back when the offending request carried none (or could not be parsed).
pub const UNKNOWN_ID: i64 = -1;

/// The fixed error table this engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InternalError,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => PARSE_ERROR,
            ErrorCode::InvalidRequest => INVALID_REQUEST,
            ErrorCode::MethodNotFound => METHOD_NOT_FOUND,
            ErrorCode::InternalError => INTERNAL_ERROR,
        }
    }

    /// Wire message for this code. `method` is only embedded by the
    /// method-specific codes.
    pub fn message(self, method: &str) -> String {
        match self {
            ErrorCode::ParseError => "ParseError: invalid JSON received".into(),
            ErrorCode::InvalidRequest => {
                "InvalidRequest: JSON sent is not a valid request object".into()
            }
            ErrorCode::MethodNotFound => format!("MethodNotFound: '{}' wasn't found", method),
            ErrorCode::InternalError => {
                format!("InternalError: Internal Error when calling '{}'", method)
            }
        }
    }
}

/// A call issued by a client. Ids are assigned by the client, starting at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Reply to a [`Request`]. Build it with [`success_response`] or
/// [`error_response`] so exactly one of `result`/`error` is set.
///
/// The id is a JSON value because the server echoes whatever the peer sent,
/// or [`UNKNOWN_ID`] when there was nothing usable.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// The `error` member of a response. A rejected call settles with this value.
///
/// Decoding is lenient: peers that leave out `code` or `message` still produce
/// a usable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Build the table entry for `code`, embedding `method` in its template.
    pub fn from_code(code: ErrorCode, method: &str, data: Option<Value>) -> Self {
        Self::new(code.code(), code.message(method), data)
    }
}

/// Create a success response with the given id and result.
pub fn success_response(id: Value, result: Value) -> Response {
    Response {
        id,
        result: Some(result),
        error: None,
    }
}

/// Create an error response with the given id and error object.
pub fn error_response(id: Value, error: RpcError) -> Response {
    Response {
        id,
        result: None,
        error: Some(error),
    }
}

/// Serialize a message to its wire text.
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
