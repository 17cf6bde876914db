//! JSON-RPC 2.0 envelopes for the LSP side.
//!
//! Inbound messages are classified by the presence of `id` and `method`:
//! both → server-originated request, `method` only → notification, `id`
//! only → response to something we sent. Outbound envelopes are built
//! here so every frame carries the same `jsonrpc` tag.

use anyhow::{bail, Result};
use serde_json::{json, Value};

/// An inbound message from a language server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Response to a request the daemon issued.
    Response {
        id: i64,
        result: Option<Value>,
        error: Option<Value>,
    },
    /// Server-originated request the daemon must answer.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Server-originated notification.
    Notification { method: String, params: Value },
}

/// Classify one decoded frame body.
pub fn classify(msg: Value) -> Result<Incoming> {
    let Value::Object(mut obj) = msg else {
        bail!("JSON-RPC message is not an object");
    };
    let method = obj.remove("method");
    let id = obj.remove("id");
    let params = obj.remove("params").unwrap_or(Value::Null);

    match (method, id) {
        (Some(Value::String(method)), Some(id)) => Ok(Incoming::Request { id, method, params }),
        (Some(Value::String(method)), None) => Ok(Incoming::Notification { method, params }),
        (None, Some(id)) => {
            let Some(id) = id.as_i64() else {
                bail!("response id is not an integer: {id}");
            };
            Ok(Incoming::Response {
                id,
                result: obj.remove("result"),
                error: obj.remove("error"),
            })
        }
        (Some(bad), _) => bail!("method field is not a string: {bad}"),
        (None, None) => bail!("message has neither method nor id"),
    }
}

pub fn request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response_with_result() {
        let msg = json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}});
        assert_eq!(
            classify(msg).unwrap(),
            Incoming::Response {
                id: 3,
                result: Some(json!({"ok": true})),
                error: None
            }
        );
    }

    #[test]
    fn classifies_response_with_error() {
        let msg = json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -32603, "message": "boom"}});
        let Incoming::Response { id, result, error } = classify(msg).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(id, 4);
        assert!(result.is_none());
        assert!(error.is_some());
    }

    #[test]
    fn classifies_notification() {
        let msg = json!({"jsonrpc": "2.0", "method": "$/progress", "params": {"token": 1}});
        assert_eq!(
            classify(msg).unwrap(),
            Incoming::Notification {
                method: "$/progress".into(),
                params: json!({"token": 1})
            }
        );
    }

    #[test]
    fn classifies_server_request_with_string_id() {
        let msg = json!({"jsonrpc": "2.0", "id": "cfg-1", "method": "workspace/configuration", "params": {}});
        let Incoming::Request { id, method, .. } = classify(msg).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(id, json!("cfg-1"));
        assert_eq!(method, "workspace/configuration");
    }

    #[test]
    fn rejects_idless_methodless_message() {
        assert!(classify(json!({"jsonrpc": "2.0"})).is_err());
    }

    #[test]
    fn outbound_request_envelope() {
        let msg = request(9, "textDocument/hover", json!({"a": 1}));
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["id"], 9);
        assert_eq!(msg["method"], "textDocument/hover");
        assert_eq!(msg["params"]["a"], 1);
    }

    #[test]
    fn outbound_response_echoes_id_shape() {
        let msg = response(json!("srv-7"), json!({"applied": true}));
        assert_eq!(msg["id"], "srv-7");
        assert_eq!(msg["result"]["applied"], true);
    }
}
