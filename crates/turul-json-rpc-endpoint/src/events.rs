//! Log and trace side channel.
//!
//! Events are mirrored to `tracing` and published on a bounded broadcast
//! channel. Publishing never waits: a subscriber that falls behind loses the
//! oldest events and observes `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::error::JsonRpcErrorObject;
use crate::types::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Structured protocol trace, one per message crossing the endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    SendRequest {
        id: RequestId,
        method: String,
        at: DateTime<Utc>,
    },
    ReceiveResponse {
        id: RequestId,
        method: String,
        at: DateTime<Utc>,
        latency_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<JsonRpcErrorObject>,
    },
    ReceiveRequest {
        id: RequestId,
        method: String,
        at: DateTime<Utc>,
    },
    SendResponse {
        id: RequestId,
        method: String,
        at: DateTime<Utc>,
        latency_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<JsonRpcErrorObject>,
    },
    SendNotification {
        method: String,
        at: DateTime<Utc>,
    },
    ReceiveNotification {
        method: String,
        at: DateTime<Utc>,
    },
    UnmatchedResponse {
        id: RequestId,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointEvent {
    Log(LogEvent),
    Trace(TraceEvent),
}

/// Publisher half of the side channel, shared by every endpoint component
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<EndpointEvent>,
    clock: Arc<dyn Clock>,
    trace_enabled: bool,
}

impl EventSink {
    pub(crate) fn new(capacity: usize, clock: Arc<dyn Clock>, trace_enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            clock,
            trace_enabled,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>, err: Option<String>) {
        let message = message.into();
        match (level, err.as_deref()) {
            (LogLevel::Trace, e) => trace!(error = ?e, "{}", message),
            (LogLevel::Debug, e) => debug!(error = ?e, "{}", message),
            (LogLevel::Info, e) => info!(error = ?e, "{}", message),
            (LogLevel::Warn, e) => warn!(error = ?e, "{}", message),
            (LogLevel::Error, e) => error!(error = ?e, "{}", message),
        }
        // No subscribers is not a failure
        let _ = self.tx.send(EndpointEvent::Log(LogEvent {
            level,
            message,
            error: err,
            at: self.clock.now(),
        }));
    }

    pub(crate) fn trace(&self, event: TraceEvent) {
        if !self.trace_enabled {
            return;
        }
        trace!(event = ?event, "jsonrpc trace");
        let _ = self.tx.send(EndpointEvent::Trace(event));
    }
}
