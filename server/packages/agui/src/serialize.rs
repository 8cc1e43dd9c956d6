//! Wire forms of [`AguiEvent`].
//!
//! `Legacy` is the dict-shaped delta protocol older UIs consume, with the
//! batch wrappers and error object they also expect. `V2` emits AG-UI event
//! objects only. Both render reasoning and tool output deltas as event
//! objects since the legacy protocol has no dict form for them.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::event::{AguiEvent, ToolCall, ToolResult, TurnContext};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    Legacy,
    V2,
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "legacy" | "v1" => Ok(Self::Legacy),
            "v2" => Ok(Self::V2),
            other => Err(format!("unknown protocol version: {other}")),
        }
    }
}

/// Renders one event as the wire objects of `version`, in emission order.
pub fn to_wire(event: &AguiEvent, context: &TurnContext, version: ProtocolVersion) -> Vec<Value> {
    match version {
        ProtocolVersion::Legacy => legacy(event, context),
        ProtocolVersion::V2 => v2(event, context),
    }
}

fn legacy(event: &AguiEvent, context: &TurnContext) -> Vec<Value> {
    match event {
        AguiEvent::RunStarted => vec![delta(
            context,
            json!({ "thread_id": context.thread_id }),
        )],
        AguiEvent::TextDelta { text } => vec![delta(context, json!({ "text": text }))],
        AguiEvent::ToolCallStarted(call) => vec![
            delta(
                context,
                json!({ "tool_call": { "id": call.id, "name": call.name, "args": call.args } }),
            ),
            tool_call_start(call, context),
            tool_call_args(call),
            json!({
                "type": "tool_calls",
                "data": {
                    "thread_id": context.thread_id,
                    "run_id": context.response_id,
                    "timestamp": timestamp(),
                    "tool_calls": [{ "id": call.id, "name": call.name, "args": call.args }],
                }
            }),
        ],
        AguiEvent::ToolCallEnded(result) => vec![
            delta(
                context,
                json!({ "tool_result": { "id": result.id, "name": result.name, "content": result.result } }),
            ),
            json!({
                "type": "tool_results",
                "data": {
                    "thread_id": context.thread_id,
                    "run_id": context.response_id,
                    "timestamp": timestamp(),
                    "tool_results": [{ "id": result.id, "name": result.name, "content": result.result }],
                }
            }),
            tool_call_end(result),
        ],
        AguiEvent::UsageMetadata { usage } => {
            vec![delta(context, json!({ "usage_metadata": usage }))]
        }
        AguiEvent::Error { message, details } => vec![
            delta(context, json!({ "error": message })),
            json!({
                "type": "error",
                "thread_id": context.thread_id,
                "run_id": context.response_id,
                "error": message,
                "details": details.clone().unwrap_or_else(|| Value::Object(Map::new())),
                "timestamp": timestamp(),
            }),
        ],
        AguiEvent::Done => vec![json!({ "type": "done", "response_id": context.response_id })],
        AguiEvent::ToolCallArgsDelta { .. }
        | AguiEvent::ReasoningStart
        | AguiEvent::ReasoningContent { .. }
        | AguiEvent::ReasoningEnd { .. } => shared(event, context),
    }
}

fn v2(event: &AguiEvent, context: &TurnContext) -> Vec<Value> {
    match event {
        AguiEvent::RunStarted => vec![json!({
            "type": "RUN_STARTED",
            "threadId": context.thread_id,
            "runId": context.response_id,
            "timestamp": timestamp(),
        })],
        AguiEvent::TextDelta { text } => vec![json!({
            "type": "TEXT_MESSAGE_CONTENT",
            "messageId": context.response_id,
            "delta": text,
            "timestamp": timestamp(),
        })],
        AguiEvent::ToolCallStarted(call) => {
            vec![tool_call_start(call, context), tool_call_args(call)]
        }
        AguiEvent::ToolCallEnded(result) => vec![tool_call_end(result)],
        AguiEvent::UsageMetadata { usage } => vec![json!({
            "type": "CUSTOM",
            "name": "usage_metadata",
            "value": usage,
            "timestamp": timestamp(),
        })],
        AguiEvent::Error { message, details } => vec![json!({
            "type": "RUN_ERROR",
            "threadId": context.thread_id,
            "runId": context.response_id,
            "message": message,
            "details": details.clone().unwrap_or_else(|| Value::Object(Map::new())),
            "timestamp": timestamp(),
        })],
        AguiEvent::Done => vec![json!({
            "type": "RUN_FINISHED",
            "threadId": context.thread_id,
            "runId": context.response_id,
            "timestamp": timestamp(),
        })],
        AguiEvent::ToolCallArgsDelta { .. }
        | AguiEvent::ReasoningStart
        | AguiEvent::ReasoningContent { .. }
        | AguiEvent::ReasoningEnd { .. } => shared(event, context),
    }
}

/// Event objects common to both versions.
fn shared(event: &AguiEvent, context: &TurnContext) -> Vec<Value> {
    let value = match event {
        AguiEvent::ToolCallArgsDelta {
            tool_call_id,
            delta,
        } => json!({
            "type": "TOOL_CALL_ARGS",
            "eventId": event_id(),
            "event_id": event_id(),
            "tool_call_id": tool_call_id,
            "delta": delta,
            "arguments": {},
            "timestamp": timestamp(),
        }),
        AguiEvent::ReasoningStart => json!({
            "type": "REASONING_START",
            "reasoning_id": context.reasoning_id,
            "reasoning_type": "analysis",
            "context": "Processing request with extended reasoning",
            "timestamp": timestamp(),
        }),
        AguiEvent::ReasoningContent { text } => json!({
            "type": "REASONING_CONTENT",
            "reasoning_id": context.reasoning_id,
            "content": text,
            "step": "reasoning",
            "confidence": 0.8,
            "timestamp": timestamp(),
        }),
        AguiEvent::ReasoningEnd { success } => {
            let (conclusion, confidence) = if *success {
                ("Reasoning completed", 0.9)
            } else {
                ("Reasoning interrupted", 0.0)
            };
            json!({
                "type": "REASONING_END",
                "reasoning_id": context.reasoning_id,
                "conclusion": conclusion,
                "confidence": confidence,
                "success": success,
                "timestamp": timestamp(),
            })
        }
        _ => return Vec::new(),
    };
    vec![value]
}

fn delta(context: &TurnContext, content: Value) -> Value {
    json!({
        "type": "delta",
        "response_id": context.response_id,
        "content": content,
    })
}

fn tool_call_start(call: &ToolCall, context: &TurnContext) -> Value {
    json!({
        "type": "TOOL_CALL_START",
        "eventId": event_id(),
        "event_id": event_id(),
        "tool_call_id": call.id,
        "tool_call_name": call.name,
        "parent_message_id": context.response_id,
        "timestamp": timestamp(),
    })
}

fn tool_call_args(call: &ToolCall) -> Value {
    let arguments = match serde_json::from_str::<Value>(&call.args) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) if call.args.is_empty() => Value::Object(Map::new()),
        Ok(_) | Err(_) => json!({ "raw": call.args }),
    };
    json!({
        "type": "TOOL_CALL_ARGS",
        "eventId": event_id(),
        "event_id": event_id(),
        "tool_call_id": call.id,
        "delta": call.args,
        "arguments": arguments,
        "timestamp": timestamp(),
    })
}

fn tool_call_end(result: &ToolResult) -> Value {
    json!({
        "type": "TOOL_CALL_END",
        "eventId": event_id(),
        "event_id": event_id(),
        "tool_call_id": result.id,
        "status": result.status,
        "result": result.result,
        "timestamp": timestamp(),
    })
}

fn event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
