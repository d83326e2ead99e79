//! # JSON-RPC 2.0 envelope construction and validation
//!
//! Requests/notifications sent to the upstream MCP-style service, and the
//! validation rules applied to whatever comes back — over plain JSON or
//! decoded from an SSE event (spec.md §4.5, §6).

use crate::transport::errors::OperationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    /// Absent on notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn call(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

fn stringify_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validate a raw response against the request it answers. On success,
/// returns the `result` value (possibly `Value::Null`); on a protocol or
/// JSON-RPC application error, returns the classified [`OperationError`].
pub fn validate_response(
    response: &JsonRpcResponse,
    request_id: &str,
) -> Result<Value, OperationError> {
    if response.jsonrpc.as_deref() != Some("2.0") {
        return Err(OperationError::new(
            crate::transport::errors::ErrorKind::Protocol,
            "invalid_jsonrpc",
            "jsonrpc field is missing or not \"2.0\"",
        ));
    }
    let Some(id) = &response.id else {
        return Err(OperationError::new(
            crate::transport::errors::ErrorKind::Protocol,
            "missing_id",
            "response has no id",
        ));
    };
    if stringify_id(id) != request_id {
        return Err(OperationError::new(
            crate::transport::errors::ErrorKind::Protocol,
            "id_mismatch",
            format!("response id {} does not match request id {request_id}", stringify_id(id)),
        ));
    }
    if let Some(error) = &response.error {
        return Err(OperationError::from_jsonrpc_code(error.code, error.message.clone()));
    }
    Ok(response.result.clone().unwrap_or(Value::Null))
}

/// `tools/call` responses that succeeded at the JSON-RPC layer can still
/// carry `isError: true` in their result — that is a Tool-class error
/// (spec.md §4.5).
pub fn check_tool_result(result: &Value) -> Option<OperationError> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        let message = result
            .get("content")
            .map(|c| c.to_string())
            .unwrap_or_else(|| "tool reported isError=true".to_string());
        Some(OperationError::new(
            crate::transport::errors::ErrorKind::Tool,
            "is_error",
            message,
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_serializes_without_id() {
        let req = JsonRpcRequest::notification("initialized", json!({}));
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn call_serializes_with_id() {
        let req = JsonRpcRequest::call("req-1", "ping", Value::Null);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], "req-1");
    }

    #[test]
    fn wrong_jsonrpc_version_is_protocol_error() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("1.0".into()),
            id: Some(json!("req-1")),
            result: Some(Value::Null),
            error: None,
        };
        let err = validate_response(&resp, "req-1").unwrap_err();
        assert_eq!(err.code, "invalid_jsonrpc");
    }

    #[test]
    fn missing_id_is_protocol_error() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: None,
            result: Some(Value::Null),
            error: None,
        };
        let err = validate_response(&resp, "req-1").unwrap_err();
        assert_eq!(err.code, "missing_id");
    }

    #[test]
    fn mismatched_id_is_protocol_error() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: Some(json!("other")),
            result: Some(Value::Null),
            error: None,
        };
        let err = validate_response(&resp, "req-1").unwrap_err();
        assert_eq!(err.code, "id_mismatch");
    }

    #[test]
    fn error_subobject_translates_to_jsonrpc_error() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: Some(json!("req-1")),
            result: None,
            error: Some(JsonRpcErrorObject {
                code: -32601,
                message: "method not found".into(),
                data: None,
            }),
        };
        let err = validate_response(&resp, "req-1").unwrap_err();
        assert_eq!(err.code, "method_not_found");
    }

    #[test]
    fn valid_response_returns_result() {
        let resp = JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id: Some(json!("req-1")),
            result: Some(json!({"ok": true})),
            error: None,
        };
        let result = validate_response(&resp, "req-1").unwrap();
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn is_error_true_is_tool_error_even_when_protocol_succeeds() {
        let result = json!({"isError": true, "content": "boom"});
        let err = check_tool_result(&result).unwrap();
        assert_eq!(err.kind, crate::transport::errors::ErrorKind::Tool);
    }

    #[test]
    fn is_error_absent_has_no_tool_error() {
        let result = json!({"content": "ok"});
        assert!(check_tool_result(&result).is_none());
    }
}
