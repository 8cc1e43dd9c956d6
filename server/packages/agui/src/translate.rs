use codex_bridge_app_server_client::{IncomingMessage, RawEvent};
use serde_json::{Map, Value};

use crate::event::{AguiEvent, TurnState};
use crate::tools::{self, DROPPED_ITEM_TYPES};

/// Methods that are understood and deliberately produce nothing.
pub const INERT_METHODS: &[&str] = &[
    "turn/diff/updated",
    "turn/plan/updated",
    "thread/name/updated",
    "turn/started",
    "thread/started",
    "item/reasoning/textDelta",
    "item/reasoning/summaryPartAdded",
    "item/plan/delta",
    "item/mcpToolCall/progress",
];

/// Item types seen on `item/started`/`item/completed` that are not tools and
/// are either handled elsewhere or not shown while streaming.
const QUIET_ITEM_TYPES: &[&str] = &["agentMessage", "userMessage"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    TextDelta,
    ItemStarted,
    ItemCompleted,
    ToolOutputDelta,
    ReasoningSummaryDelta,
    Error,
    TokenUsage,
    TurnCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Produced by the client rather than read from the app-server.
    Synthetic,
    /// Carries an id and a method: the app-server expects an answer.
    ServerRequest,
    Notification(NotificationKind),
    Inert,
    Unknown,
}

pub fn classify(raw: &RawEvent) -> EventClass {
    let value = match raw {
        RawEvent::TurnStarted { .. } | RawEvent::Error { .. } => return EventClass::Synthetic,
        RawEvent::Message(value) => value,
    };
    match IncomingMessage::classify(value) {
        Some(IncomingMessage::ServerRequest { .. }) => return EventClass::ServerRequest,
        Some(IncomingMessage::Notification { .. }) => {}
        _ => return EventClass::Unknown,
    }

    let method = value.get("method").and_then(Value::as_str).unwrap_or_default();
    let kind = match method {
        "item/agentMessage/delta" => NotificationKind::TextDelta,
        "item/started" => NotificationKind::ItemStarted,
        "item/completed" => NotificationKind::ItemCompleted,
        "item/commandExecution/outputDelta" | "item/fileChange/outputDelta" => {
            NotificationKind::ToolOutputDelta
        }
        "item/reasoning/summaryTextDelta" => NotificationKind::ReasoningSummaryDelta,
        "error" => NotificationKind::Error,
        "thread/tokenUsage/updated" => NotificationKind::TokenUsage,
        "turn/completed" => NotificationKind::TurnCompleted,
        other if INERT_METHODS.contains(&other) => return EventClass::Inert,
        _ => return EventClass::Unknown,
    };
    EventClass::Notification(kind)
}

/// Translates one raw event. Never fails: anything unrecognized is logged and
/// yields no events. Once a terminal event has been produced for the turn,
/// every later raw event yields nothing. The turn's identifiers are applied
/// afterwards by [`to_wire`](crate::to_wire).
pub fn translate(raw: &RawEvent, state: &mut TurnState) -> Vec<AguiEvent> {
    if state.finished {
        tracing::debug!(method = raw.method(), "agui: event after terminal, dropped");
        return Vec::new();
    }

    let class = classify(raw);
    match (class, raw) {
        (EventClass::Synthetic, RawEvent::TurnStarted { .. }) => Vec::new(),
        (EventClass::Synthetic, RawEvent::Error { message, error }) => {
            fail(state, message.clone(), error.clone())
        }
        (EventClass::ServerRequest, RawEvent::Message(value)) => {
            tracing::warn!(
                method = value.get("method").and_then(serde_json::Value::as_str).unwrap_or("<none>"),
                id = %value.get("id").cloned().unwrap_or(serde_json::Value::Null),
                "agui: unanswered server request (approval?)"
            );
            Vec::new()
        }
        (EventClass::Notification(kind), RawEvent::Message(value)) => {
            let empty = Value::Object(Map::new());
            let params = value.get("params").unwrap_or(&empty);
            translate_notification(kind, params, state)
        }
        (EventClass::Inert, _) => Vec::new(),
        _ => {
            tracing::warn!(
                method = raw.method().unwrap_or("<none>"),
                "agui: unmapped event"
            );
            Vec::new()
        }
    }
}

/// Terminal events for a stream that ended without producing one.
pub fn finish_unterminated(state: &mut TurnState) -> Vec<AguiEvent> {
    if state.finished {
        return Vec::new();
    }
    tracing::warn!("agui: turn stream ended without a terminal event");
    fail(state, "Turn ended unexpectedly".to_string(), None)
}

fn translate_notification(
    kind: NotificationKind,
    params: &Value,
    state: &mut TurnState,
) -> Vec<AguiEvent> {
    match kind {
        NotificationKind::TextDelta => vec![AguiEvent::TextDelta {
            text: str_param(params, "delta"),
        }],
        NotificationKind::ItemStarted => {
            let item = params.get("item").unwrap_or(&Value::Null);
            if let Some(call) = tools::tool_call(item) {
                return vec![AguiEvent::ToolCallStarted(call)];
            }
            match item_type(item) {
                "reasoning" => {
                    if state.reasoning.open() {
                        vec![AguiEvent::ReasoningStart]
                    } else {
                        Vec::new()
                    }
                }
                other => {
                    note_untranslated_item(other);
                    Vec::new()
                }
            }
        }
        NotificationKind::ItemCompleted => {
            let item = params.get("item").unwrap_or(&Value::Null);
            if let Some(result) = tools::tool_result(item) {
                return vec![AguiEvent::ToolCallEnded(result)];
            }
            match item_type(item) {
                "reasoning" => {
                    if state.reasoning.close() {
                        vec![AguiEvent::ReasoningEnd { success: true }]
                    } else {
                        Vec::new()
                    }
                }
                other => {
                    note_untranslated_item(other);
                    Vec::new()
                }
            }
        }
        NotificationKind::ToolOutputDelta => {
            let delta = str_param(params, "delta");
            if delta.is_empty() {
                tracing::debug!("agui: output delta without content");
            }
            vec![AguiEvent::ToolCallArgsDelta {
                tool_call_id: str_param(params, "itemId"),
                delta,
            }]
        }
        NotificationKind::ReasoningSummaryDelta => {
            let mut events = Vec::with_capacity(2);
            if state.reasoning.open() {
                events.push(AguiEvent::ReasoningStart);
            }
            events.push(AguiEvent::ReasoningContent {
                text: str_param(params, "delta"),
            });
            events
        }
        NotificationKind::Error => {
            let will_retry = params
                .get("willRetry")
                .or_else(|| params.get("will_retry"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let error = params.get("error").cloned();
            let message = error
                .as_ref()
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            if will_retry {
                tracing::debug!(message = %message, "agui: transient error, app-server will retry");
                return Vec::new();
            }
            fail(state, message, error)
        }
        NotificationKind::TokenUsage => vec![AguiEvent::UsageMetadata {
            usage: params.clone(),
        }],
        NotificationKind::TurnCompleted => {
            let turn = params.get("turn").unwrap_or(&Value::Null);
            if turn.get("status").and_then(Value::as_str) == Some("failed") {
                let error = turn.get("error").filter(|error| !error.is_null()).cloned();
                let message = error
                    .as_ref()
                    .and_then(|error| error.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Turn failed")
                    .to_string();
                fail(state, message, error)
            } else {
                succeed(state)
            }
        }
    }
}

fn succeed(state: &mut TurnState) -> Vec<AguiEvent> {
    let mut events = Vec::with_capacity(2);
    if state.reasoning.close() {
        events.push(AguiEvent::ReasoningEnd { success: true });
    }
    events.push(AguiEvent::Done);
    state.finished = true;
    events
}

fn fail(state: &mut TurnState, message: String, details: Option<Value>) -> Vec<AguiEvent> {
    let mut events = Vec::with_capacity(3);
    if state.reasoning.close() {
        events.push(AguiEvent::ReasoningEnd { success: false });
    }
    events.push(AguiEvent::Error { message, details });
    events.push(AguiEvent::Done);
    state.finished = true;
    events
}

fn note_untranslated_item(item_type: &str) {
    if !QUIET_ITEM_TYPES.contains(&item_type) && !DROPPED_ITEM_TYPES.contains(&item_type) {
        tracing::warn!(item_type = %item_type, "agui: unknown item type");
    }
}

fn item_type(item: &Value) -> &str {
    item.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn str_param(params: &Value, key: &str) -> String {
    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(method: &str, params: Value) -> RawEvent {
        RawEvent::Message(json!({ "method": method, "params": params }))
    }

    fn run(events: &[RawEvent]) -> Vec<AguiEvent> {
        let mut state = TurnState::new();
        events
            .iter()
            .flat_map(|raw| translate(raw, &mut state))
            .collect()
    }

    fn kinds(events: &[AguiEvent]) -> Vec<&'static str> {
        events.iter().map(AguiEvent::kind).collect()
    }

    #[test]
    fn unknown_methods_translate_to_nothing() {
        let mut state = TurnState::new();
        let raw = notification("item/somethingNew", json!({ "x": 1 }));
        assert_eq!(classify(&raw), EventClass::Unknown);
        assert!(translate(&raw, &mut state).is_empty());
        assert!(translate(&RawEvent::Message(json!({ "foo": "bar" })), &mut state).is_empty());
        assert!(translate(&RawEvent::Message(json!(42)), &mut state).is_empty());
        assert_eq!(state, TurnState::new());
    }

    #[test]
    fn inert_methods_are_not_unknown() {
        for method in INERT_METHODS {
            let raw = notification(method, json!({}));
            assert_eq!(classify(&raw), EventClass::Inert, "{method}");
            assert!(run(&[raw]).is_empty());
        }
    }

    #[test]
    fn server_requests_are_flagged_not_translated() {
        let raw = RawEvent::Message(json!({
            "id": 9,
            "method": "item/commandExecution/requestApproval",
            "params": { "itemId": "call_1" }
        }));
        assert_eq!(classify(&raw), EventClass::ServerRequest);
        assert!(run(&[raw]).is_empty());
    }

    #[test]
    fn duplicate_reasoning_starts_emit_once() {
        let reasoning = json!({ "item": { "type": "reasoning", "id": "rs_1" } });
        let events = run(&[
            notification("item/started", reasoning.clone()),
            notification("item/started", reasoning.clone()),
            notification("item/reasoning/summaryTextDelta", json!({ "delta": "hmm" })),
            notification("item/completed", reasoning.clone()),
            notification("item/completed", reasoning),
        ]);
        assert_eq!(
            kinds(&events),
            vec!["reasoning_start", "reasoning_content", "reasoning_end"]
        );
    }

    #[test]
    fn summary_delta_opens_reasoning_implicitly() {
        let events = run(&[notification(
            "item/reasoning/summaryTextDelta",
            json!({ "delta": "Plan" }),
        )]);
        assert_eq!(
            events,
            vec![
                AguiEvent::ReasoningStart,
                AguiEvent::ReasoningContent {
                    text: "Plan".to_string()
                },
            ]
        );
    }

    #[test]
    fn command_round_trip() {
        let events = run(&[
            notification(
                "item/started",
                json!({ "item": { "type": "commandExecution", "id": "call_1", "command": "ls", "cwd": "/tmp" } }),
            ),
            notification(
                "item/commandExecution/outputDelta",
                json!({ "itemId": "call_1", "delta": "a.txt" }),
            ),
            notification(
                "item/completed",
                json!({ "item": { "type": "commandExecution", "id": "call_1", "aggregatedOutput": "a.txt", "exitCode": 0 } }),
            ),
        ]);
        match &events[..] {
            [AguiEvent::ToolCallStarted(call), AguiEvent::ToolCallArgsDelta { tool_call_id, delta }, AguiEvent::ToolCallEnded(result)] =>
            {
                assert!(call.args.contains(r#"{"command":"ls","cwd":"/tmp"}"#));
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(delta, "a.txt");
                assert!(result.result.ends_with("[exit code: 0]"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn transient_errors_are_swallowed() {
        let events = run(&[notification(
            "error",
            json!({ "error": { "message": "reconnecting" }, "willRetry": true }),
        )]);
        assert!(events.is_empty());
    }

    #[test]
    fn error_notification_is_terminal() {
        let events = run(&[
            notification("item/started", json!({ "item": { "type": "reasoning", "id": "rs" } })),
            notification("error", json!({ "error": { "message": "quota exceeded" }, "willRetry": false })),
            notification("turn/completed", json!({ "turn": { "id": "t", "status": "failed" } })),
            notification("item/agentMessage/delta", json!({ "delta": "late" })),
        ]);
        assert_eq!(
            events,
            vec![
                AguiEvent::ReasoningStart,
                AguiEvent::ReasoningEnd { success: false },
                AguiEvent::Error {
                    message: "quota exceeded".to_string(),
                    details: Some(json!({ "message": "quota exceeded" })),
                },
                AguiEvent::Done,
            ]
        );
    }

    #[test]
    fn failed_turn_uses_its_error_message() {
        let events = run(&[notification(
            "turn/completed",
            json!({ "turn": { "id": "t", "status": "failed", "error": null } }),
        )]);
        assert_eq!(
            events,
            vec![
                AguiEvent::Error {
                    message: "Turn failed".to_string(),
                    details: None,
                },
                AguiEvent::Done,
            ]
        );
    }

    #[test]
    fn closed_pipe_yields_error_then_done() {
        let events = run(&[
            RawEvent::TurnStarted { turn: json!({ "id": "t" }) },
            notification("item/agentMessage/delta", json!({ "delta": "Hel" })),
            RawEvent::closed(),
        ]);
        assert_eq!(kinds(&events), vec!["text_delta", "error", "done"]);
    }

    #[test]
    fn exactly_one_terminal_event_and_it_is_last() {
        let scripts: Vec<Vec<RawEvent>> = vec![
            vec![notification("turn/completed", json!({ "turn": { "status": "completed" } }))],
            vec![
                RawEvent::closed(),
                notification("turn/completed", json!({ "turn": { "status": "completed" } })),
            ],
            vec![
                notification("error", json!({ "error": { "message": "x" } })),
                RawEvent::closed(),
            ],
            vec![
                notification("item/reasoning/summaryTextDelta", json!({ "delta": "a" })),
                notification("turn/completed", json!({ "turn": { "status": "failed" } })),
                notification("turn/completed", json!({ "turn": { "status": "completed" } })),
            ],
        ];
        for script in scripts {
            let events = run(&script);
            let terminals = events.iter().filter(|event| event.is_terminal()).count();
            assert_eq!(terminals, 1, "{events:?}");
            assert!(events.last().is_some_and(AguiEvent::is_terminal), "{events:?}");
        }
    }

    #[test]
    fn unterminated_stream_is_closed_once() {
        let mut state = TurnState::new();
        let events = finish_unterminated(&mut state);
        assert_eq!(kinds(&events), vec!["error", "done"]);
        assert!(finish_unterminated(&mut state).is_empty());
    }

    #[test]
    fn full_turn_snapshot() {
        let events = run(&[
            RawEvent::TurnStarted { turn: json!({ "id": "turn_1" }) },
            notification("turn/started", json!({ "turn": { "id": "turn_1" } })),
            notification("item/started", json!({ "item": { "type": "reasoning", "id": "rs_1" } })),
            notification("item/reasoning/summaryTextDelta", json!({ "delta": "Thinking" })),
            notification("item/completed", json!({ "item": { "type": "reasoning", "id": "rs_1" } })),
            notification("item/started", json!({ "item": { "type": "webSearch", "id": "ws_1", "query": "rust" } })),
            notification("item/completed", json!({ "item": { "type": "webSearch", "id": "ws_1", "action": { "type": "search" } } })),
            notification("item/started", json!({ "item": { "type": "agentMessage", "id": "msg_1" } })),
            notification("item/agentMessage/delta", json!({ "delta": "Hi" })),
            notification("item/completed", json!({ "item": { "type": "agentMessage", "id": "msg_1", "text": "Hi" } })),
            notification("thread/tokenUsage/updated", json!({ "tokenUsage": { "total": { "totalTokens": 3 } } })),
            notification("turn/completed", json!({ "turn": { "id": "turn_1", "status": "completed" } })),
        ]);
        insta::assert_yaml_snapshot!(kinds(&events), @r###"
        ---
        - reasoning_start
        - reasoning_content
        - reasoning_end
        - tool_call_started
        - tool_call_ended
        - text_delta
        - usage_metadata
        - done
        "###);
    }
}
