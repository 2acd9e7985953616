//! JSON-RPC 2.0 wire types, adopted verbatim — the gateway does not invent
//! its own protocol, it relays this one untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message id. JSON-RPC allows string, number, or null; we keep the raw
/// `serde_json::Value` rather than forcing a typed id so pass-through is
/// always lossless (`parse(serialize(msg)) == msg`).
pub type MessageId = Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorData>,
}

impl JsonRpcResponse {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse one newline-delimited JSON-RPC frame. Malformed frames are the
/// caller's problem to log at WARN and discard without killing the process.
pub fn parse_frame(line: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(line)
}

/// Serialize one frame as a single line with the trailing `\n` the stdio
/// wire format requires. The body never contains an embedded newline since
/// `serde_json` never emits literal `\n` inside a compact-encoded value.
pub fn serialize_frame(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(value)?;
    s.push('\n');
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let req = JsonRpcRequest::new("tools/list", Some(json!({"cursor": null}))).with_id(json!(1));
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: JsonRpcRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn response_round_trips_with_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(42),
            result: None,
            error: Some(JsonRpcErrorData {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: JsonRpcResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(resp, decoded);
        assert!(decoded.is_error());
    }

    #[test]
    fn serialize_frame_appends_single_newline() {
        let req = JsonRpcRequest::new("ping", None).with_id(json!(1));
        let frame = serialize_frame(&req).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }
}
