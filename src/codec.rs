// Copyright 2020 Joyent, Inc.

//! Envelope types and the text codec used on the message channel.
//!
//! Every relay-rpc message is the `FRAME_MARKER` prefix followed by a
//! JSON-RPC 2.0 shaped object.  Text that does not start with the marker
//! belongs to some other user of the shared channel and decodes to `None`.

use std::fmt;

use serde::de::Deserializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::pending::CallId;

pub const FRAME_MARKER: &str = "relayrpc.";
pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Application defined: the caller's origin failed the procedure's ACL.
pub const ACCESS_DENIED: i64 = -32099;
/// Application defined: the procedure itself reported a failure.
pub const REMOTE_FAULT: i64 = -32098;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Call parameters, either an ordered sequence or a mapping of names to
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Default for Params {
    fn default() -> Self {
        Params::Positional(Vec::new())
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Named(map)
    }
}

/// A request or response identifier as it appears on the wire.  Any string
/// is accepted from peers and echoed back unchanged; only identifiers this
/// endpoint generated map back to a `CallId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pending call this identifier names, if it is one of ours.
    pub fn call_id(&self) -> Option<CallId> {
        self.0.parse().ok()
    }
}

impl From<CallId> for MessageId {
    fn from(id: CallId) -> Self {
        MessageId(id.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId(String::from(id))
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        MessageId(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Whatever the sender put here.  A missing or non-string version is kept
    /// as text so the dispatcher can answer it with an invalid request error.
    #[serde(default, deserialize_with = "version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
}

fn version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match <Value as serde::Deserialize>::deserialize(deserializer)? {
        Value::String(version) => Ok(version),
        other => Ok(other.to_string()),
    }
}

impl Request {
    pub fn new(method: &str, params: Params, id: Option<MessageId>) -> Request {
        Request {
            jsonrpc: String::from(JSONRPC_VERSION),
            method: String::from(method),
            params,
            id,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// The error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: &str, data: Option<Value>) -> RpcError {
        RpcError {
            code,
            message: String::from(message),
            data,
        }
    }

    pub fn invalid_request() -> RpcError {
        RpcError::new(
            INVALID_REQUEST,
            "Invalid request",
            Some(Value::from("The received JSON is not a valid JSON-RPC 2.0 request")),
        )
    }

    pub fn method_not_found(method: &str) -> RpcError {
        RpcError::new(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(Value::from(format!(
                "The requested remote procedure {} does not exist or is not available",
                method
            ))),
        )
    }

    pub fn invalid_params(detail: String) -> RpcError {
        RpcError::new(INVALID_PARAMS, "Invalid params", Some(Value::from(detail)))
    }

    pub fn access_denied() -> RpcError {
        RpcError::new(ACCESS_DENIED, "Server error", Some(Value::from("Access denied")))
    }

    pub fn remote_fault(message: &str, data: Option<Value>) -> RpcError {
        let data = data.unwrap_or_else(|| Value::from(message));
        RpcError::new(REMOTE_FAULT, "Server error", Some(data))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)?;
        if let Some(data) = &self.data {
            write!(f, ": {}", data)?;
        }
        Ok(())
    }
}

/// Either half of a response body.  `Success(Value::Null)` is a present
/// `null` result, distinct from a missing one.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<MessageId>,
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: Option<MessageId>, result: Value) -> Response {
        Response {
            jsonrpc: String::from(JSONRPC_VERSION),
            id,
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: Option<MessageId>, error: RpcError) -> Response {
        Response {
            jsonrpc: String::from(JSONRPC_VERSION),
            id,
            outcome: Outcome::Failure(error),
        }
    }
}

// Wire shape of a response.  `id` is always written, `null` included.
#[derive(Serialize, Deserialize)]
struct ResponseBody {
    jsonrpc: String,
    id: Option<MessageId>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    <Value as serde::Deserialize>::deserialize(deserializer).map(Some)
}

impl From<&Response> for ResponseBody {
    fn from(response: &Response) -> Self {
        let (result, error) = match &response.outcome {
            Outcome::Success(value) => (Some(value.clone()), None),
            Outcome::Failure(err) => (None, Some(err.clone())),
        };
        ResponseBody {
            jsonrpc: response.jsonrpc.clone(),
            id: response.id.clone(),
            result,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

pub fn encode(envelope: &Envelope) -> String {
    // Serializing these types cannot fail: every map key is a string.
    let body = match envelope {
        Envelope::Request(req) => serde_json::to_string(req),
        Envelope::Response(resp) => serde_json::to_string(&ResponseBody::from(resp)),
    }
    .unwrap_or_default();

    [FRAME_MARKER, &body].concat()
}

/// Decode channel text.  Returns `Ok(None)` for text that is not framed as a
/// relay-rpc message.
pub fn decode(text: &str) -> Result<Option<Envelope>, CodecError> {
    let body = match text.strip_prefix(FRAME_MARKER) {
        Some(body) => body,
        None => return Ok(None),
    };

    let value: Value = serde_json::from_str(body)
        .map_err(|e| CodecError::MalformedMessage(format!("invalid JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| CodecError::MalformedMessage(String::from("envelope is not an object")))?;

    if object.contains_key("method") {
        let req: Request = serde_json::from_value(value)
            .map_err(|e| CodecError::MalformedMessage(format!("invalid request: {}", e)))?;
        return Ok(Some(Envelope::Request(req)));
    }

    let body: ResponseBody = serde_json::from_value(value)
        .map_err(|e| CodecError::MalformedMessage(format!("invalid response: {}", e)))?;

    let outcome = match (body.result, body.error) {
        (Some(result), None) => Outcome::Success(result),
        (None, Some(error)) => Outcome::Failure(error),
        (Some(_), Some(_)) => {
            let msg = "response carries both result and error";
            return Err(CodecError::MalformedMessage(String::from(msg)));
        }
        (None, None) => {
            let msg = "response carries neither result nor error";
            return Err(CodecError::MalformedMessage(String::from(msg)));
        }
    };

    Ok(Some(Envelope::Response(Response {
        jsonrpc: body.jsonrpc,
        id: body.id,
        outcome,
    })))
}
