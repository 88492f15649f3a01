//! JSON-RPC message model
//!
//! Decodes raw payloads into requests, notifications and responses, and encodes them
//! back onto the wire. A request and a notification differ only in the presence of an id.

use std::fmt;

use serde::{
    de::{self, Deserializer},
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::{json, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error codes. The negative `-327xx`/`-326xx` range is reserved by JSON-RPC,
/// everything else is application defined.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const UNAUTHORIZED: i32 = -32001;
    pub const NOT_FOUND: i32 = -32002;
    pub const RATE_LIMITED: i32 = -32003;
    pub const SHUTTING_DOWN: i32 = -32004;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A typed protocol failure.
///
/// Two errors are equal when their codes are equal, so callers can test
/// `err == RpcError::unauthorized("")` regardless of the message text.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PartialEq for RpcError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for RpcError {}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
            .with_data(json!({ "method": method }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(codes::UNAUTHORIZED, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(codes::RATE_LIMITED, message)
    }

    pub fn shutting_down() -> Self {
        Self::new(codes::SHUTTING_DOWN, "Server is shutting down")
    }

    pub fn cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "Request cancelled")
    }

    pub fn is(&self, code: i32) -> bool {
        self.code == code
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` only when the failing request's id could not be recovered.
    pub id: Option<RequestId>,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// A payload that could not be turned into a [`Message`].
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct DecodeError {
    pub id: Option<RequestId>,
    pub error: RpcError,
    /// The payload named a method but carried no id, so nobody is waiting for a reply.
    pub is_notification: bool,
}

impl DecodeError {
    fn new(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            error,
            is_notification: false,
        }
    }

    /// The error response owed to the peer, if any.
    pub fn into_response(self) -> Option<Response> {
        if self.is_notification {
            None
        } else {
            Some(Response::error(self.id, self.error))
        }
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

// Keeps an explicit `null` as `Some(Value::Null)` so "field absent" and
// "field is null" stay distinguishable.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn parse_id(raw: Option<Value>) -> Result<Option<RequestId>, ()> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if id.is_empty() => Ok(None),
        Some(Value::String(id)) => Ok(Some(RequestId::String(id))),
        Some(Value::Number(number)) => number.as_i64().map(|id| Some(RequestId::Integer(id))).ok_or(()),
        Some(_) => Err(()),
    }
}

impl Message {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(|err| {
            DecodeError::new(
                None,
                RpcError::parse_error().with_data(json!({ "details": err.to_string() })),
            )
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        if !value.is_object() {
            return Err(DecodeError::new(None, RpcError::invalid_request()));
        }

        let raw: RawMessage = serde_json::from_value(value)
            .map_err(|_| DecodeError::new(None, RpcError::invalid_request()))?;

        let id = match parse_id(raw.id) {
            Ok(id) => id,
            Err(()) => return Err(DecodeError::new(None, RpcError::invalid_request())),
        };

        let invalid = |id: Option<RequestId>, has_method: bool| DecodeError {
            is_notification: has_method && id.is_none(),
            id,
            error: RpcError::invalid_request(),
        };

        if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err(invalid(id, raw.method.is_some()));
        }

        match (raw.method, raw.result, raw.error) {
            (Some(method), None, None) => {
                let method = match method {
                    Value::String(method) if !method.trim().is_empty() => method,
                    _ => return Err(invalid(id, true)),
                };
                if let Some(params) = &raw.params {
                    if !params.is_object() && !params.is_array() && !params.is_null() {
                        return Err(DecodeError {
                            is_notification: id.is_none(),
                            id,
                            error: RpcError::invalid_params("params must be an object or array"),
                        });
                    }
                }
                let params = raw.params.filter(|params| !params.is_null());
                Ok(match id {
                    Some(id) => Self::Request(Request { id, method, params }),
                    None => Self::Notification(Notification { method, params }),
                })
            }
            (None, Some(result), None) => match id {
                Some(id) => Ok(Self::Response(Response::success(id, result))),
                None => Err(invalid(None, false)),
            },
            (None, None, Some(error)) => {
                let error: RpcError =
                    serde_json::from_value(error).map_err(|_| invalid(id.clone(), false))?;
                Ok(Self::Response(Response::error(id, error)))
            }
            (method, _, _) => Err(invalid(id, method.is_some())),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("method", &self.method)?;
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        map.end()
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("method", &self.method)?;
        if let Some(params) = &self.params {
            map.serialize_entry("params", params)?;
        }
        map.end()
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Ok(result) => map.serialize_entry("result", result)?,
            Err(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(request) => request.serialize(serializer),
            Self::Notification(notification) => notification.serialize(serializer),
            Self::Response(response) => response.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}
