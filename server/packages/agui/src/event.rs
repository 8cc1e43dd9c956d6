use serde::Serialize;
use serde_json::Value;

/// Translated event, independent of the wire format it is later
/// serialized to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AguiEvent {
    RunStarted,
    TextDelta { text: String },
    ToolCallStarted(ToolCall),
    /// Streamed output of a running command or file change.
    ToolCallArgsDelta { tool_call_id: String, delta: String },
    ToolCallEnded(ToolResult),
    ReasoningStart,
    ReasoningContent { text: String },
    ReasoningEnd { success: bool },
    UsageMetadata { usage: Value },
    Error {
        message: String,
        details: Option<Value>,
    },
    Done,
}

impl AguiEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCallStarted(_) => "tool_call_started",
            Self::ToolCallArgsDelta { .. } => "tool_call_args_delta",
            Self::ToolCallEnded(_) => "tool_call_ended",
            Self::ReasoningStart => "reasoning_start",
            Self::ReasoningContent { .. } => "reasoning_content",
            Self::ReasoningEnd { .. } => "reasoning_end",
            Self::UsageMetadata { .. } => "usage_metadata",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub status: String,
    pub result: String,
}

/// Identifiers fixed for the lifetime of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnContext {
    pub thread_id: String,
    pub response_id: String,
    pub reasoning_id: String,
}

impl TurnContext {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            response_id: uuid::Uuid::new_v4().to_string(),
            reasoning_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReasoningPhase {
    #[default]
    Closed,
    Open,
}

impl ReasoningPhase {
    /// Returns true only on the Closed to Open transition.
    pub fn open(&mut self) -> bool {
        let opened = *self == Self::Closed;
        *self = Self::Open;
        opened
    }

    /// Returns true only on the Open to Closed transition.
    pub fn close(&mut self) -> bool {
        let closed = *self == Self::Open;
        *self = Self::Closed;
        closed
    }

    pub fn is_open(&self) -> bool {
        *self == Self::Open
    }
}

/// Mutable translation state for one turn. Start a fresh one per turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnState {
    pub reasoning: ReasoningPhase,
    /// Set once the terminal event has been produced.
    pub finished: bool,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }
}
