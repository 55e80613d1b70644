use serde_json::{Value, json};

use crate::error::{GatewayError, GatewayResult};

/// A parsed inbound JSON-RPC message. Requests carry an id; notifications
/// do not and never receive a response.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

impl IncomingMessage {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Classify a raw JSON value as request or notification based on the
/// presence of `method` and `id`.
pub fn parse_message(raw: &Value) -> GatewayResult<IncomingMessage> {
    let obj = raw
        .as_object()
        .ok_or_else(|| GatewayError::InvalidRequest("expected a JSON object".to_string()))?;

    if let Some(version) = obj.get("jsonrpc")
        && version.as_str() != Some("2.0")
    {
        return Err(GatewayError::InvalidRequest(
            "jsonrpc version must be '2.0'".to_string(),
        ));
    }

    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .ok_or_else(|| GatewayError::InvalidRequest("missing 'method'".to_string()))?
        .to_string();

    let id = obj.get("id").cloned().filter(|v| !v.is_null());
    let params = obj.get("params").cloned();

    Ok(IncomingMessage { id, method, params })
}

pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub fn error_response(id: Option<Value>, err: &GatewayError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": err.to_error_object()
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let msg = parse_message(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "call_tool",
            "params": {"name": "echo"}
        }))
        .unwrap();
        assert_eq!(msg.method, "call_tool");
        assert_eq!(msg.id, Some(json!(1)));
        assert!(!msg.is_notification());
    }

    #[test]
    fn test_parse_notification_has_no_id() {
        let msg = parse_message(&json!({"jsonrpc": "2.0", "method": "initialized"})).unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn test_null_id_is_notification() {
        let msg =
            parse_message(&json!({"jsonrpc": "2.0", "id": null, "method": "ping"})).unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn test_missing_method_rejected() {
        let err = parse_message(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let err = parse_message(&json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})).unwrap_err();
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(parse_message(&json!([1, 2])).is_err());
        assert!(parse_message(&json!("hello")).is_err());
    }

    #[test]
    fn test_error_response_envelope() {
        let err = GatewayError::Session("expired".to_string());
        let resp = error_response(Some(json!(7)), &err);
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["error"]["code"], -32006);
        assert_eq!(resp["error"]["data"]["kind"], "session");
        assert!(resp.get("result").is_none());
    }

    #[test]
    fn test_success_response_envelope() {
        let resp = success_response(json!("abc"), json!({"ok": true}));
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], "abc");
        assert_eq!(resp["result"]["ok"], true);
    }
}
