//! Wire shapes of the app-server's line-delimited JSON-RPC dialect.
//!
//! Requests are `{method, id, params?}`, notifications are `{method, params?}`
//! and responses are `{id, result?}` or `{id, error}`. The app-server does not
//! send or expect a `jsonrpc` member.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type RequestId = i64;

#[derive(Debug, Serialize)]
pub struct OutgoingMessage<'a> {
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> OutgoingMessage<'a> {
    pub fn request(method: &'a str, id: RequestId, params: Option<&'a Value>) -> Self {
        Self {
            method,
            id: Some(id),
            params,
        }
    }

    pub fn notification(method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Lenient decode: a bare string or an object without `message` still
    /// yields something printable.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self {
                code: None,
                message: message.clone(),
                data: None,
            },
            Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                code: None,
                message: value.to_string(),
                data: None,
            }),
            other => Self {
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// An inbound line, classified by which members it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response { id: Value, result: Value },
    Error { id: Value, error: RpcError },
    Notification { method: String, params: Value },
    /// Carries both `id` and `method`: the app-server is asking us something
    /// (approvals) and would expect a reply.
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
}

impl IncomingMessage {
    pub fn classify(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = object.get("id").cloned();
        let method = object.get("method").and_then(Value::as_str);
        let params = object
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        match (id, method) {
            (Some(id), Some(method))
                if !object.contains_key("result") && !object.contains_key("error") =>
            {
                Some(Self::ServerRequest {
                    id,
                    method: method.to_string(),
                    params,
                })
            }
            (_, Some(method)) => Some(Self::Notification {
                method: method.to_string(),
                params,
            }),
            (Some(id), None) => match object.get("error") {
                Some(error) => Some(Self::Error {
                    id,
                    error: RpcError::from_value(error),
                }),
                None => Some(Self::Response {
                    id,
                    result: object.get("result").cloned().unwrap_or(Value::Null),
                }),
            },
            (None, None) => None,
        }
    }
}
