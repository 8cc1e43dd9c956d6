//! Maps Codex app-server turn events onto the AG-UI event vocabulary.
//!
//! Translation works on an internal [`AguiEvent`] model with per-turn
//! [`TurnState`]; [`to_wire`] renders events in the legacy or v2 format.

mod event;
mod history;
mod response;
mod serialize;
pub mod tools;
mod translate;

pub use event::{AguiEvent, ReasoningPhase, ToolCall, ToolResult, TurnContext, TurnState};
pub use history::{
    history_messages, HistoryFunction, HistoryMessage, HistoryResponse, HistoryToolCall,
    DEFAULT_CHAT_NAME,
};
pub use response::{AguiMessage, AguiResponse, ContentObject, ResponseMetadata, ResponseStatus};
pub use serialize::{to_wire, ProtocolVersion};
pub use translate::{
    classify, finish_unterminated, translate, EventClass, NotificationKind, INERT_METHODS,
};
