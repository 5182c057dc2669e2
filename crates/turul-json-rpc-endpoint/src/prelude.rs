//! # JSON-RPC Endpoint Prelude
//!
//! Convenient re-exports of the types most endpoint users need.
//!
//! ```rust
//! use turul_json_rpc_endpoint::prelude::*;
//! ```

// Endpoint lifecycle
pub use crate::config::EndpointConfig;
pub use crate::endpoint::{Completion, Endpoint, EndpointBuilder, IncomingResponse, ShutdownStatus};
pub use crate::transport::{ChannelTransport, EndpointIo, InboundStream, PeerIo};

// Handlers and outcomes
pub use crate::error::{EndpointError, HandlerError, JsonRpcErrorObject, TransportError};
pub use crate::events::{EndpointEvent, LogLevel, TraceEvent};
pub use crate::handler::{HandlerRegistry, NotificationHandler, RequestHandler};
pub use crate::pending::{PendingRequest, RequestOutcome};

// Wire types
pub use crate::message::Message;
pub use crate::notification::JsonRpcNotification;
pub use crate::request::{JsonRpcRequest, RequestParams};
pub use crate::response::{JsonRpcResponse, ResponseResult};
pub use crate::types::RequestId;

// Standard error codes
pub use crate::error_codes::*;
