//! Wire message model.
//!
//! Every frame on every transport is one JSON object of the shape
//! `{jsonrpc?, id?, method?, params?, result?, error?}`. Classification:
//! `id` + `method` is a request, `id` alone is a response, no `id` is a
//! notification.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version stamped on every outbound frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Correlation identifier linking a request to its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create an error without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

/// Outbound or inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Response to a request: either a result or an error object.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

/// Fire-and-forget message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    /// Create a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A classified wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Raw frame shape as it appears on the wire.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    params: Option<Value>,
    // `"result": null` is a valid success and must not collapse into "absent".
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Frame {
    /// Build a request frame.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification frame.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification::new(method, params))
    }

    /// Build a success response frame.
    #[must_use]
    pub fn result(id: RequestId, result: Value) -> Self {
        Self::Response(Response {
            id,
            outcome: Ok(result),
        })
    }

    /// Build an error response frame.
    #[must_use]
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self::Response(Response {
            id,
            outcome: Err(error),
        })
    }

    /// Correlation id, if the frame carries one.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Method name, if the frame carries one.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// Decode and classify one frame.
    ///
    /// # Errors
    /// Returns `ProtocolError` if the bytes are not JSON or the object does
    /// not classify as a request, response or notification.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_slice(bytes)?;
        Self::classify(raw)
    }

    /// Decode one frame from a string slice.
    ///
    /// # Errors
    /// See [`Frame::decode`].
    pub fn decode_str(text: &str) -> Result<Self, ProtocolError> {
        Self::decode(text.as_bytes())
    }

    /// Decode one frame from an already-parsed JSON value.
    ///
    /// # Errors
    /// See [`Frame::decode`].
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_value(value)?;
        Self::classify(raw)
    }

    fn classify(raw: RawFrame) -> Result<Self, ProtocolError> {
        if let Some(version) = raw.jsonrpc.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(ProtocolError::Malformed(format!(
                    "unsupported jsonrpc version {version}"
                )));
            }
        }

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request(Request {
                id,
                method,
                params: raw.params,
            })),
            (Some(id), None) => match (raw.result, raw.error) {
                (Some(_), Some(_)) => Err(ProtocolError::Malformed(format!(
                    "response {id} carries both result and error"
                ))),
                (Some(result), None) => Ok(Self::result(id, result)),
                (None, Some(error)) => Ok(Self::error(id, error)),
                (None, None) => Err(ProtocolError::Malformed(format!(
                    "response {id} carries neither result nor error"
                ))),
            },
            (None, Some(method)) => Ok(Self::Notification(Notification {
                method,
                params: raw.params,
            })),
            (None, None) => match raw.error {
                Some(error) => Err(ProtocolError::Malformed(format!(
                    "error response without id: {}",
                    error.message
                ))),
                None => Err(ProtocolError::Malformed(
                    "frame has neither id nor method".to_string(),
                )),
            },
        }
    }

    fn into_raw(self) -> RawFrame {
        let mut raw = RawFrame {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            ..RawFrame::default()
        };
        match self {
            Self::Request(r) => {
                raw.id = Some(r.id);
                raw.method = Some(r.method);
                raw.params = r.params;
            }
            Self::Response(r) => {
                raw.id = Some(r.id);
                match r.outcome {
                    Ok(result) => raw.result = Some(result),
                    Err(error) => raw.error = Some(error),
                }
            }
            Self::Notification(n) => {
                raw.method = Some(n.method);
                raw.params = n.params;
            }
        }
        raw
    }

    /// Encode as a JSON value.
    ///
    /// # Errors
    /// Returns error if a params or result value fails to serialize.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self.clone().into_raw())?)
    }

    /// Encode as compact JSON bytes (no trailing newline).
    ///
    /// # Errors
    /// Returns error if a params or result value fails to serialize.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(&self.clone().into_raw())?))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_classifies_request() {
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"n":1}}"#)
            .unwrap();
        assert_eq!(frame, Frame::request(7_i64, "echo", Some(json!({"n": 1}))));
    }

    #[test]
    fn test_classifies_string_id_response() {
        let frame = Frame::decode(br#"{"id":"abc","result":{"ok":true}}"#).unwrap();
        assert_eq!(frame, Frame::result(RequestId::from("abc"), json!({"ok": true})));
    }

    #[test]
    fn test_null_result_is_a_success() {
        let frame = Frame::decode(br#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(frame, Frame::result(RequestId::Number(1), Value::Null));
    }

    #[test]
    fn test_classifies_error_response() {
        let frame =
            Frame::decode(br#"{"id":2,"error":{"code":-32601,"message":"nope","data":[1]}}"#)
                .unwrap();
        let Frame::Response(response) = frame else {
            panic!("expected response");
        };
        let error = response.outcome.unwrap_err();
        assert_eq!(error.code, codes::METHOD_NOT_FOUND);
        assert_eq!(error.data, Some(json!([1])));
    }

    #[test]
    fn test_classifies_notification() {
        let frame = Frame::decode(br#"{"method":"progress","params":{"pct":50}}"#).unwrap();
        assert_eq!(frame.id(), None);
        assert_eq!(frame.method(), Some("progress"));
    }

    #[test]
    fn test_rejects_frames_without_id_or_method() {
        let err = Frame::decode(br#"{"params":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));

        let err = Frame::decode(br#"{"id":null,"error":{"code":-32700,"message":"bad"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("without id"));
    }

    #[test]
    fn test_rejects_ambiguous_response() {
        let err = Frame::decode(br#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_rejects_garbage_and_wrong_version() {
        assert!(matches!(
            Frame::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(Frame::decode(br#"{"jsonrpc":"1.0","method":"x"}"#).is_err());
    }

    #[test]
    fn test_encode_stamps_version_and_omits_absent_fields() {
        let bytes = Frame::notification("initialized", None).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "initialized"}));

        let bytes = Frame::result(RequestId::Number(3), Value::Null).encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 3, "result": null}));
    }
}
