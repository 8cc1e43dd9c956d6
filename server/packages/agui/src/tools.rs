//! Thread items that represent tool use, and their normalized names,
//! argument payloads and results.

use serde::Serialize;
use serde_json::Value;

use crate::event::{ToolCall, ToolResult};

/// Item types that carry nothing worth showing in a transcript.
pub const DROPPED_ITEM_TYPES: &[&str] = &[
    "contextCompaction",
    "plan",
    "imageView",
    "enteredReviewMode",
    "exitedReviewMode",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Mcp,
    CommandExecution,
    FileChange,
    Collab,
    WebSearch,
}

impl ToolKind {
    pub fn from_item_type(item_type: &str) -> Option<Self> {
        match item_type {
            "mcpToolCall" => Some(Self::Mcp),
            "commandExecution" => Some(Self::CommandExecution),
            "fileChange" => Some(Self::FileChange),
            "collabToolCall" | "collabAgentToolCall" => Some(Self::Collab),
            "webSearch" => Some(Self::WebSearch),
            _ => None,
        }
    }

    pub fn of(item: &Value) -> Option<Self> {
        item.get("type").and_then(Value::as_str).and_then(Self::from_item_type)
    }
}

pub fn tool_call(item: &Value) -> Option<ToolCall> {
    let kind = ToolKind::of(item)?;
    Some(ToolCall {
        id: tool_call_id(item),
        name: tool_name(kind, item),
        args: tool_args(kind, item),
    })
}

pub fn tool_result(item: &Value) -> Option<ToolResult> {
    let kind = ToolKind::of(item)?;
    Some(ToolResult {
        id: tool_call_id(item),
        name: tool_name(kind, item),
        status: str_field(item, "status").unwrap_or("completed").to_string(),
        result: tool_output(kind, item),
    })
}

fn tool_call_id(item: &Value) -> String {
    str_field(item, "id")
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn tool_name(kind: ToolKind, item: &Value) -> String {
    match kind {
        ToolKind::Mcp => str_field(item, "tool").unwrap_or("unknown_mcp_tool").to_string(),
        ToolKind::CommandExecution => "command_execution".to_string(),
        ToolKind::FileChange => "file_change".to_string(),
        ToolKind::Collab => "collab_tool".to_string(),
        ToolKind::WebSearch => "web_search".to_string(),
    }
}

#[derive(Serialize)]
struct CommandArgs<'a> {
    command: &'a str,
    cwd: &'a str,
}

#[derive(Serialize)]
struct FileChangeArgs<'a> {
    changes: &'a Value,
}

#[derive(Serialize)]
struct FileChangeResult<'a> {
    changes: &'a Value,
    status: &'a str,
}

#[derive(Serialize)]
struct WebSearchArgs<'a> {
    query: &'a str,
}

#[derive(Serialize)]
struct CollabArgs<'a> {
    tool: &'a str,
    prompt: &'a str,
}

#[derive(Serialize)]
struct CollabResult<'a> {
    status: &'a str,
    agents_states: &'a Value,
}

fn tool_args(kind: ToolKind, item: &Value) -> String {
    let empty_list = Value::Array(Vec::new());
    let empty_object = Value::Object(Default::default());
    match kind {
        ToolKind::CommandExecution => encode(&CommandArgs {
            command: str_field(item, "command").unwrap_or_default(),
            cwd: str_field(item, "cwd").unwrap_or_default(),
        }),
        ToolKind::FileChange => encode(&FileChangeArgs {
            changes: item.get("changes").unwrap_or(&empty_list),
        }),
        ToolKind::Mcp => encode(item.get("arguments").unwrap_or(&empty_object)),
        ToolKind::WebSearch => encode(&WebSearchArgs {
            query: str_field(item, "query").unwrap_or_default(),
        }),
        ToolKind::Collab => encode(&CollabArgs {
            tool: str_field(item, "tool").unwrap_or_default(),
            prompt: str_field(item, "prompt").unwrap_or_default(),
        }),
    }
}

fn tool_output(kind: ToolKind, item: &Value) -> String {
    let empty_list = Value::Array(Vec::new());
    match kind {
        ToolKind::CommandExecution => {
            let output = str_field(item, "aggregatedOutput").unwrap_or_default();
            match item.get("exitCode").and_then(Value::as_i64) {
                Some(code) => format!("{output}\n[exit code: {code}]"),
                None => output.to_string(),
            }
        }
        ToolKind::FileChange => encode(&FileChangeResult {
            changes: item.get("changes").unwrap_or(&empty_list),
            status: str_field(item, "status").unwrap_or_default(),
        }),
        ToolKind::Mcp => ["result", "error"]
            .iter()
            .filter_map(|key| item.get(*key))
            .find(|value| is_truthy(value))
            .map(text_or_json)
            .unwrap_or_default(),
        ToolKind::WebSearch => match item.get("action") {
            Some(action) => encode(action),
            None => encode(&""),
        },
        ToolKind::Collab => encode(&CollabResult {
            status: str_field(item, "status").unwrap_or_default(),
            agents_states: item.get("agentsStates").unwrap_or(&empty_list),
        }),
    }
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn text_or_json(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}
