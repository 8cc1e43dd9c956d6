use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::tools::{self, DROPPED_ITEM_TYPES};

pub const DEFAULT_CHAT_NAME: &str = "New Chat";
pub const AGENT_TYPE: &str = "codex";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HistoryFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HistoryToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: HistoryFunction,
}

/// OpenAI-style chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<HistoryToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl HistoryMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryMessage>,
    pub user_id: String,
    pub thread_id: String,
    pub message_count: usize,
    pub chat_name: String,
    pub agent_type: String,
}

impl HistoryResponse {
    /// Builds the response from a `thread/read` thread object.
    pub fn from_thread(thread: &Value, thread_id: &str, user_id: &str) -> Self {
        let messages = history_messages(thread);
        let chat_name = thread
            .get("preview")
            .and_then(Value::as_str)
            .filter(|preview| !preview.is_empty())
            .unwrap_or(DEFAULT_CHAT_NAME)
            .to_string();
        Self {
            message_count: messages.len(),
            messages,
            user_id: user_id.to_string(),
            thread_id: thread
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(thread_id)
                .to_string(),
            chat_name,
            agent_type: AGENT_TYPE.to_string(),
        }
    }
}

/// Flattens every turn's items into chat messages. A tool item becomes an
/// assistant message carrying the call plus a `tool` message with its
/// result.
pub fn history_messages(thread: &Value) -> Vec<HistoryMessage> {
    let turns = thread
        .get("turns")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut messages = Vec::new();
    for turn in turns {
        let items = turn
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for item in items {
            push_item(item, &mut messages);
        }
    }
    messages
}

fn push_item(item: &Value, messages: &mut Vec<HistoryMessage>) {
    let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
    match item_type {
        "userMessage" => messages.push(HistoryMessage::plain("user", user_text(item))),
        "agentMessage" => messages.push(HistoryMessage::plain(
            "assistant",
            item.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
        )),
        "reasoning" => {}
        _ => {
            if let (Some(call), Some(result)) = (tools::tool_call(item), tools::tool_result(item)) {
                // The result reuses the call's id so both halves match even
                // when the item had none.
                let id = call.id;
                messages.push(HistoryMessage {
                    tool_calls: Some(vec![HistoryToolCall {
                        id: id.clone(),
                        call_type: "function".to_string(),
                        function: HistoryFunction {
                            name: call.name.clone(),
                            arguments: call.args,
                        },
                    }]),
                    ..HistoryMessage::plain("assistant", String::new())
                });
                messages.push(HistoryMessage {
                    tool_call_id: Some(id),
                    name: Some(result.name),
                    ..HistoryMessage::plain("tool", result.result)
                });
            } else if !DROPPED_ITEM_TYPES.contains(&item_type) {
                tracing::warn!(item_type = %item_type, "history: unknown item type");
            }
        }
    }
}

/// Joins the text parts of a `userMessage` item.
pub(crate) fn user_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .map(|part| part.get("text").and_then(Value::as_str).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
