//! Outbound message union written to the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JsonRpcError;
use crate::notification::JsonRpcNotification;
use crate::request::JsonRpcRequest;
use crate::response::JsonRpcResponse;
use crate::types::RequestId;

/// Any fully-structured JSON-RPC message the endpoint emits.
///
/// Serializes to the exact wire shape of the wrapped variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl Message {
    /// The correlation id, if the message carries one
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Notification(_) => None,
            Message::Response(resp) => Some(&resp.id),
            Message::Error(err) => err.id.as_ref(),
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(notif) => Some(&notif.method),
            Message::Response(_) | Message::Error(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_) | Message::Error(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(request: JsonRpcRequest) -> Self {
        Message::Request(request)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notification: JsonRpcNotification) -> Self {
        Message::Notification(notification)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Message::Response(response)
    }
}

impl From<JsonRpcError> for Message {
    fn from(error: JsonRpcError) -> Self {
        Message::Error(error)
    }
}
