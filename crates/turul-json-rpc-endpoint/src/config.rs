//! Configuration types for the endpoint

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::CANCEL_REQUEST_METHOD;

/// Endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Maximum number of inbound messages processed concurrently
    pub parallelism: usize,

    /// Publish request/response/notification trace events on the side channel
    pub trace: bool,

    /// Upper bound on how long `shutdown` waits for in-flight work to drain
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Capacity of the log/trace broadcast buffer. Slow subscribers lose the
    /// oldest events once it is exceeded.
    pub event_capacity: usize,

    /// Method name of the out-of-band cancellation notification
    pub cancel_method: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            trace: false,
            shutdown_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            cancel_method: CANCEL_REQUEST_METHOD.to_string(),
        }
    }
}

impl EndpointConfig {
    /// Parallelism clamped to at least one worker
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    /// Broadcast capacity clamped to a valid channel size
    pub fn effective_event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// Helper module for Duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
