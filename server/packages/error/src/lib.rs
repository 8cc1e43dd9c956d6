use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    ThreadNotFound,
    Transport,
    Protocol,
    Capacity,
    Timeout,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:codex-bridge:error:invalid_request",
            Self::TokenInvalid => "urn:codex-bridge:error:token_invalid",
            Self::ThreadNotFound => "urn:codex-bridge:error:thread_not_found",
            Self::Transport => "urn:codex-bridge:error:transport",
            Self::Protocol => "urn:codex-bridge:error:protocol",
            Self::Capacity => "urn:codex-bridge:error:capacity",
            Self::Timeout => "urn:codex-bridge:error:timeout",
            Self::Internal => "urn:codex-bridge:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TokenInvalid => "Token Invalid",
            Self::ThreadNotFound => "Thread Not Found",
            Self::Transport => "App Server Unavailable",
            Self::Protocol => "App Server Error",
            Self::Capacity => "Session Capacity Reached",
            Self::Timeout => "Timeout",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TokenInvalid => 401,
            Self::ThreadNotFound => 404,
            Self::Transport => 502,
            Self::Protocol => 502,
            Self::Capacity => 503,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }

    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity | Self::Timeout | Self::Transport)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
    #[error("thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },
    /// The app-server subprocess is unavailable: spawn failure, closed pipe,
    /// failed handshake. Fatal to the owning session.
    #[error("app-server unavailable: {message}")]
    Transport { message: String },
    /// A well-formed JSON-RPC error response. The session stays usable.
    #[error("{method} failed: {message}")]
    Protocol {
        method: String,
        code: Option<i64>,
        message: String,
        data: Option<Value>,
    },
    #[error("maximum concurrent sessions ({limit}) reached")]
    Capacity { limit: usize },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
            Self::ThreadNotFound { .. } => ErrorType::ThreadNotFound,
            Self::Transport { .. } => ErrorType::Transport,
            Self::Protocol { .. } => ErrorType::Protocol,
            Self::Capacity { .. } => ErrorType::Capacity,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    /// True for JSON-RPC errors that report a missing thread.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ThreadNotFound { .. } => true,
            Self::Protocol { message, .. } => message.to_ascii_lowercase().contains("not found"),
            _ => false,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::ThreadNotFound { thread_id } => {
                extensions.insert("threadId".to_string(), Value::String(thread_id.clone()));
            }
            Self::Protocol {
                method, code, data, ..
            } => {
                extensions.insert("method".to_string(), Value::String(method.clone()));
                if let Some(code) = code {
                    extensions.insert("code".to_string(), Value::from(*code));
                }
                if let Some(data) = data {
                    extensions.insert("details".to_string(), data.clone());
                }
            }
            Self::Capacity { limit } => {
                extensions.insert("maxSessions".to_string(), Value::from(*limit as u64));
            }
            Self::TokenInvalid {
                message: Some(message),
            }
            | Self::Timeout {
                message: Some(message),
            } => {
                extensions.insert("message".to_string(), Value::String(message.clone()));
            }
            _ => {}
        }
        if self.error_type().is_retryable() {
            extensions.insert("retryable".to_string(), Value::Bool(true));
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&BridgeError> for ProblemDetails {
    fn from(value: &BridgeError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_maps_to_retryable_service_unavailable() {
        let problem = BridgeError::Capacity { limit: 4 }.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:codex-bridge:error:capacity");
        assert_eq!(problem.extensions["maxSessions"], Value::from(4u64));
        assert_eq!(problem.extensions["retryable"], Value::Bool(true));
    }

    #[test]
    fn protocol_error_keeps_method_and_code() {
        let err = BridgeError::Protocol {
            method: "thread/read".to_string(),
            code: Some(-32600),
            message: "thread not found: abc".to_string(),
            data: None,
        };
        assert!(err.is_not_found());
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(problem.extensions["method"], "thread/read");
        assert_eq!(problem.extensions["code"], Value::from(-32600));
        assert!(problem.extensions.get("retryable").is_none());
    }

    #[test]
    fn problem_details_flatten_extensions() {
        let problem = BridgeError::ThreadNotFound {
            thread_id: "thr_1".to_string(),
        }
        .to_problem_details();
        let value = serde_json::to_value(&problem).expect("serialize problem");
        assert_eq!(value["status"], 404);
        assert_eq!(value["threadId"], "thr_1");
        assert_eq!(value["detail"], "thread not found: thr_1");
    }
}
