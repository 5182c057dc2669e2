//! Structural classification of decoded inbound messages.
//!
//! Every inbound value is mapped onto exactly one [`InboundMessage`] before any
//! dispatch happens. Classification is total: malformed input becomes
//! [`InboundMessage::ParseError`] or [`InboundMessage::InvalidRequest`], never a panic.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{JsonRpcErrorObject, TransportError};
use crate::notification::JsonRpcNotification;
use crate::request::{JsonRpcRequest, RequestParams};
use crate::types::RequestId;

/// Fieldless discriminant of [`InboundMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
    ResponseResult,
    ResponseError,
    ParseError,
    InvalidRequest,
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    ResponseResult {
        id: RequestId,
        result: Value,
    },
    ResponseError {
        id: RequestId,
        error: JsonRpcErrorObject,
    },
    /// The transport could not decode the input at all
    ParseError { reason: String },
    /// Decoded but structurally invalid. `id` is only kept for request-shaped
    /// input, where a correlated error reply is possible.
    InvalidRequest {
        id: Option<RequestId>,
        reason: String,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Request(_) => MessageKind::Request,
            InboundMessage::Notification(_) => MessageKind::Notification,
            InboundMessage::ResponseResult { .. } => MessageKind::ResponseResult,
            InboundMessage::ResponseError { .. } => MessageKind::ResponseError,
            InboundMessage::ParseError { .. } => MessageKind::ParseError,
            InboundMessage::InvalidRequest { .. } => MessageKind::InvalidRequest,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            InboundMessage::ResponseResult { .. } | InboundMessage::ResponseError { .. }
        )
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            InboundMessage::Request(req) => Some(&req.id),
            InboundMessage::ResponseResult { id, .. } | InboundMessage::ResponseError { id, .. } => {
                Some(id)
            }
            InboundMessage::InvalidRequest { id, .. } => id.as_ref(),
            InboundMessage::Notification(_) | InboundMessage::ParseError { .. } => None,
        }
    }

    fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        InboundMessage::InvalidRequest {
            id,
            reason: reason.into(),
        }
    }
}

/// Envelope used for structural validation. Every member is optional so that
/// deserializing any JSON object succeeds; the rules run on what is present.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    jsonrpc: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
    // `"result": null` is a valid success, so presence is tracked separately from null
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Classify an item produced by the inbound transport
pub fn classify(raw: Result<Value, TransportError>) -> InboundMessage {
    match raw {
        Ok(value) => classify_value(value),
        Err(error) => InboundMessage::ParseError {
            reason: error.to_string(),
        },
    }
}

/// Classify a JSON string; decode failures become [`InboundMessage::ParseError`]
pub fn classify_str(input: &str) -> InboundMessage {
    classify(serde_json::from_str::<Value>(input).map_err(TransportError::from))
}

/// Classify an already-decoded JSON value
pub fn classify_value(value: Value) -> InboundMessage {
    if value.is_array() {
        return InboundMessage::invalid(None, "batch messages are not supported");
    }
    if !value.is_object() {
        return InboundMessage::invalid(None, "message is not a JSON object");
    }

    let envelope = match Envelope::deserialize(value) {
        Ok(envelope) => envelope,
        Err(error) => return InboundMessage::invalid(None, error.to_string()),
    };

    let has_method = envelope.method.is_some();

    let id = match envelope.id.as_ref() {
        None => None,
        Some(raw_id) => match RequestId::from_value(raw_id) {
            Some(id) => Some(id),
            None => {
                return InboundMessage::invalid(
                    None,
                    format!("id must be a string or an integer, got {}", raw_id),
                );
            }
        },
    };

    // Only request-shaped input gets a correlated reply; answering a broken
    // response would just bounce errors between the peers.
    let reply_id = if has_method { id.clone() } else { None };

    match envelope.jsonrpc.as_ref() {
        None => {}
        Some(Value::String(version)) if version == crate::JSONRPC_VERSION => {}
        Some(other) => {
            return InboundMessage::invalid(reply_id, format!("unsupported jsonrpc version {}", other));
        }
    }

    let method = match envelope.method {
        None => None,
        Some(Value::String(method)) => Some(method),
        Some(other) => {
            return InboundMessage::invalid(reply_id, format!("method must be a string, got {}", other));
        }
    };

    match (id, method) {
        (Some(id), Some(method)) => match params(envelope.params) {
            Ok(params) => InboundMessage::Request(JsonRpcRequest::new(id, method, params)),
            Err(reason) => InboundMessage::invalid(Some(id), reason),
        },
        (None, Some(method)) => match params(envelope.params) {
            Ok(params) => InboundMessage::Notification(JsonRpcNotification::new(method, params)),
            Err(reason) => InboundMessage::invalid(None, reason),
        },
        (Some(id), None) => match (envelope.result, envelope.error) {
            (Some(result), None) => InboundMessage::ResponseResult { id, result },
            (None, Some(error)) => match serde_json::from_value::<JsonRpcErrorObject>(error) {
                Ok(error) => InboundMessage::ResponseError { id, error },
                Err(e) => InboundMessage::invalid(None, format!("malformed error object: {}", e)),
            },
            (Some(_), Some(_)) => {
                InboundMessage::invalid(None, "response carries both result and error")
            }
            (None, None) => InboundMessage::invalid(None, "response carries neither result nor error"),
        },
        (None, None) => InboundMessage::invalid(None, "message has neither id nor method"),
    }
}

fn params(raw: Option<Value>) -> Result<Option<RequestParams>, String> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => RequestParams::from_value(value)
            .map(Some)
            .ok_or_else(|| "params must be an array or an object".to_string()),
    }
}
