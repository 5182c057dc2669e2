use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{JsonRpcVersion, RequestId};

/// Parameters for a JSON-RPC request or notification
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RequestParams {
    /// Positional parameters as an array
    Array(Vec<Value>),
    /// Named parameters as an object
    Object(Map<String, Value>),
}

impl RequestParams {
    /// Accept a raw value as params. JSON-RPC only allows arrays and objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(RequestParams::Array(items)),
            Value::Object(map) => Some(RequestParams::Object(map)),
            _ => None,
        }
    }

    /// Get a parameter by name (object params only)
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            RequestParams::Object(map) => map.get(key),
            RequestParams::Array(_) => None,
        }
    }

    /// Get a parameter by index (array params only)
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            RequestParams::Array(vec) => vec.get(index),
            RequestParams::Object(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RequestParams::Object(map) => map.is_empty(),
            RequestParams::Array(vec) => vec.is_empty(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestParams::Object(map) => Value::Object(map.clone()),
            RequestParams::Array(arr) => Value::Array(arr.clone()),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            RequestParams::Object(map) => Value::Object(map),
            RequestParams::Array(arr) => Value::Array(arr),
        }
    }

    /// Deserialize the parameters into a typed structure
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }
}

impl From<Map<String, Value>> for RequestParams {
    fn from(map: Map<String, Value>) -> Self {
        RequestParams::Object(map)
    }
}

impl From<Vec<Value>> for RequestParams {
    fn from(vec: Vec<Value>) -> Self {
        RequestParams::Array(vec)
    }
}

/// A JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<RequestParams>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            method: method.into(),
            params,
        }
    }

    /// Create a new request with no parameters
    pub fn new_no_params(id: RequestId, method: impl Into<String>) -> Self {
        Self::new(id, method, None)
    }

    /// Get a parameter by name (if params are an object)
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref()?.get(name)
    }

    /// Get a parameter by index (if params are an array)
    pub fn get_param_index(&self, index: usize) -> Option<&Value> {
        self.params.as_ref()?.get_index(index)
    }
}
