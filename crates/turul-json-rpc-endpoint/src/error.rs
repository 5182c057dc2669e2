use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

use crate::error_codes;
use crate::types::{JsonRpcVersion, RequestId};

/// JSON-RPC error codes the endpoint itself produces or recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    RequestCancelled,
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            JsonRpcErrorCode::ParseError => error_codes::PARSE_ERROR,
            JsonRpcErrorCode::InvalidRequest => error_codes::INVALID_REQUEST,
            JsonRpcErrorCode::MethodNotFound => error_codes::METHOD_NOT_FOUND,
            JsonRpcErrorCode::InvalidParams => error_codes::INVALID_PARAMS,
            JsonRpcErrorCode::InternalError => error_codes::INTERNAL_ERROR,
            JsonRpcErrorCode::RequestCancelled => error_codes::REQUEST_CANCELLED,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            JsonRpcErrorCode::ParseError => "Parse error",
            JsonRpcErrorCode::InvalidRequest => "Invalid Request",
            JsonRpcErrorCode::MethodNotFound => "Method not found",
            JsonRpcErrorCode::InvalidParams => "Invalid params",
            JsonRpcErrorCode::InternalError => "Internal error",
            JsonRpcErrorCode::RequestCancelled => "Request cancelled",
        }
    }
}

impl fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// JSON-RPC Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: JsonRpcErrorCode, message: Option<String>, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: message.unwrap_or_else(|| code.message().to_string()),
            data,
        }
    }

    /// Build an error object with an application-defined code
    pub fn application(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn invalid_request(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidRequest, None, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound,
            Some(format!("Method '{}' not found", method)),
            Some(json!({ "method": method })),
        )
    }

    pub fn invalid_params(message: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams,
            Some(message.to_string()),
            None,
        )
    }

    pub fn internal_error(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::InternalError, None, data)
    }

    pub fn request_cancelled(id: &RequestId, method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::RequestCancelled,
            Some(format!("The request {} ({}) has been cancelled", id, method)),
            Some(json!({ "id": id, "method": method })),
        )
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// JSON-RPC Error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub error: JsonRpcErrorObject,
}

impl JsonRpcError {
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorObject) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            error,
        }
    }

    pub fn invalid_request(id: Option<RequestId>, reason: Option<String>) -> Self {
        Self::new(
            id,
            JsonRpcErrorObject::invalid_request(reason.map(Value::String)),
        )
    }

    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(Some(id), JsonRpcErrorObject::method_not_found(method))
    }

    pub fn internal_error(id: Option<RequestId>, data: Option<Value>) -> Self {
        Self::new(id, JsonRpcErrorObject::internal_error(data))
    }

    pub fn request_cancelled(id: RequestId, method: &str) -> Self {
        let error = JsonRpcErrorObject::request_cancelled(&id, method);
        Self::new(Some(id), error)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JSON-RPC Error {}: {}",
            self.error.code, self.error.message
        )
    }
}

impl std::error::Error for JsonRpcError {}

/// Failures reported by the transport feeding the endpoint (no domain logic)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport closed")]
    Closed,
}

/// Errors surfaced by the endpoint's public operations
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint has already been started")]
    AlreadyStarted,

    #[error("Outbound transport is closed")]
    TransportClosed,

    #[error("Failed to serialize parameters: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Parameters must serialize to an object, an array or null")]
    InvalidParams,
}

/// Errors returned by registered handlers.
///
/// `Rpc` carries an application-chosen error object that is sent to the peer
/// untouched. `Fault` is an unexpected failure and is reported as an
/// `InternalError` response.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Rpc(JsonRpcErrorObject),

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn rpc(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        HandlerError::Rpc(JsonRpcErrorObject::application(code, message, data))
    }

    pub fn invalid_params(message: &str) -> Self {
        HandlerError::Rpc(JsonRpcErrorObject::invalid_params(message))
    }

    pub fn fault(message: impl fmt::Display) -> Self {
        HandlerError::Fault(anyhow::anyhow!("{}", message))
    }
}

impl From<JsonRpcErrorObject> for HandlerError {
    fn from(error: JsonRpcErrorObject) -> Self {
        HandlerError::Rpc(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::Rpc(JsonRpcErrorObject::invalid_params(&error.to_string()))
    }
}
