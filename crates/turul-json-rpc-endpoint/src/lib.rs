//! # JSON-RPC 2.0 Endpoint Engine
//!
//! A transport-agnostic, bidirectional JSON-RPC 2.0 endpoint. Either side of a
//! connection can send requests and notifications; the endpoint turns the
//! inbound message stream into dispatched, ordered, correlated and cancellable
//! protocol traffic.
//!
//! ## Features
//! - Structural message classification (requests, notifications, responses, malformed input)
//! - Bounded-concurrency dispatch that still emits replies in arrival order
//! - Backpressure from the outbound sink all the way back to the inbound reader
//! - Pending-request handles with bounded waits and at-most-once cancellation
//! - Inbound `$/cancelRequest` support for long-running handlers
//! - Structured log/trace side channel with an injectable clock
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use turul_json_rpc_endpoint::{ChannelTransport, Endpoint, HandlerError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (io, _peer) = ChannelTransport::pair(64);
//!
//!     let endpoint = Endpoint::<()>::builder()
//!         .parallelism(4)
//!         .on_request("ping", |_ctx, _params| async move { Ok::<_, HandlerError>(json!("pong")) })
//!         .build(io.inbound, io.outbound);
//!
//!     let completion = endpoint.start(())?;
//!     endpoint.shutdown().await;
//!     completion.wait().await;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handler;
pub mod message;
pub mod notification;
pub mod pending;
pub mod pipeline;
pub mod prelude;
pub mod request;
pub mod response;
pub mod transport;
pub mod types;

// Re-export main types
pub use classify::{InboundMessage, MessageKind, classify, classify_value};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EndpointConfig;
pub use endpoint::{Completion, Endpoint, EndpointBuilder, IncomingResponse, ShutdownStatus};
pub use error::{
    EndpointError, HandlerError, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject,
    TransportError,
};
pub use events::{EndpointEvent, LogEvent, LogLevel, TraceEvent};
pub use handler::{HandlerRegistry, NotificationHandler, RequestHandler};
pub use message::Message;
pub use notification::JsonRpcNotification;
pub use pending::{PendingRequest, RequestOutcome, RequestState};
pub use request::{JsonRpcRequest, RequestParams};
pub use response::{JsonRpcResponse, ResponseResult};
pub use transport::{ChannelTransport, EndpointIo, InboundStream, PeerIo};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Default method name used for out-of-band request cancellation
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;

    /// Reply code for an inbound request the peer cancelled while it was running
    pub const REQUEST_CANCELLED: i64 = -32800;
}
