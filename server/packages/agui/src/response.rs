use codex_bridge_app_server_client::RawEvent;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::history::{user_text, HistoryFunction, HistoryToolCall, AGENT_TYPE};
use crate::serialize::timestamp;
use crate::tools::{self, DROPPED_ITEM_TYPES};
use crate::translate::{classify, EventClass, NotificationKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ContentObject {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ContentObject {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AguiMessage {
    pub id: String,
    pub role: String,
    pub content: ContentObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<HistoryToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AguiMessage {
    fn new(id: String, role: &str, text: impl Into<String>) -> Self {
        Self {
            id,
            role: role.to_string(),
            content: ContentObject::text(text),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ResponseMetadata {
    pub user_id: String,
    pub thread_id: String,
    pub agent_type: String,
}

/// Aggregate answer for a non-streaming chat request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AguiResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub created_at: String,
    pub status: ResponseStatus,
    pub messages: Vec<AguiMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

impl AguiResponse {
    /// Collects the completed items of a turn into messages. The status is
    /// `error` when the turn failed or the stream ended with an error.
    pub fn from_raw_events(events: &[RawEvent], thread_id: &str, user_id: &str) -> Self {
        let mut messages = Vec::new();
        let mut error = None;

        for raw in events {
            match (classify(raw), raw) {
                (EventClass::Synthetic, RawEvent::Error { message, .. }) => {
                    error.get_or_insert_with(|| message.clone());
                }
                (EventClass::Notification(NotificationKind::ItemCompleted), RawEvent::Message(value)) => {
                    if let Some(item) = value.pointer("/params/item") {
                        push_item(item, &mut messages);
                    }
                }
                (EventClass::Notification(NotificationKind::Error), RawEvent::Message(value)) => {
                    let params = value.get("params");
                    let will_retry = params
                        .and_then(|params| params.get("willRetry"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !will_retry {
                        let message = params
                            .and_then(|params| params.pointer("/error/message"))
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown error");
                        error.get_or_insert_with(|| message.to_string());
                    }
                }
                (EventClass::Notification(NotificationKind::TurnCompleted), RawEvent::Message(value)) => {
                    if value.pointer("/params/turn/status").and_then(Value::as_str) == Some("failed") {
                        let message = value
                            .pointer("/params/turn/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("Turn failed");
                        error.get_or_insert_with(|| message.to_string());
                    }
                }
                _ => {}
            }
        }

        Self {
            id: new_id(),
            response_type: "response".to_string(),
            created_at: timestamp(),
            status: if error.is_some() {
                ResponseStatus::Error
            } else {
                ResponseStatus::Ok
            },
            messages,
            error,
            metadata: ResponseMetadata {
                user_id: user_id.to_string(),
                thread_id: thread_id.to_string(),
                agent_type: AGENT_TYPE.to_string(),
            },
        }
    }
}

fn push_item(item: &Value, messages: &mut Vec<AguiMessage>) {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
    let item_id = || {
        item.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_id)
    };
    match item_type {
        "userMessage" => messages.push(AguiMessage::new(item_id(), "user", user_text(item))),
        "agentMessage" => messages.push(AguiMessage::new(
            item_id(),
            "assistant",
            item.get("text").and_then(Value::as_str).unwrap_or_default(),
        )),
        "reasoning" => {}
        _ => {
            if let (Some(call), Some(result)) = (tools::tool_call(item), tools::tool_result(item)) {
                messages.push(AguiMessage {
                    tool_calls: Some(vec![HistoryToolCall {
                        id: call.id.clone(),
                        call_type: "function".to_string(),
                        function: HistoryFunction {
                            name: call.name.clone(),
                            arguments: call.args,
                        },
                    }]),
                    ..AguiMessage::new(new_id(), "assistant", "")
                });
                messages.push(AguiMessage {
                    tool_call_id: Some(call.id),
                    name: Some(result.name),
                    ..AguiMessage::new(new_id(), "tool", result.result)
                });
            } else if !DROPPED_ITEM_TYPES.contains(&item_type) {
                tracing::warn!(item_type = %item_type, "agui: unknown item type in response");
            }
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
