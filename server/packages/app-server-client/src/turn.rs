use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, Stream};
use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, OwnedMutexGuard};

use crate::client::Connection;
use crate::jsonrpc::{IncomingMessage, RequestId};

pub const CLOSED_MESSAGE: &str = "App-server closed";
pub const STALLED_MESSAGE: &str = "App-server stopped sending turn events";
const TURN_STARTED: &str = "turn/started";
const TURN_COMPLETED: &str = "turn/completed";

/// One item of a turn stream, before translation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Synthesized from the `turn/start` response.
    TurnStarted { turn: Value },
    /// Synthesized when the turn could not run to completion: an error
    /// response to `turn/start`, or the pipe closing mid-turn.
    Error {
        message: String,
        error: Option<Value>,
    },
    /// A line read from the app-server, verbatim.
    Message(Value),
}

impl RawEvent {
    pub fn closed() -> Self {
        Self::Error {
            message: CLOSED_MESSAGE.to_string(),
            error: None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Message(value) => value.get("method").and_then(Value::as_str),
            _ => None,
        }
    }

    /// The dict shape these events had on the wire of the original bridge:
    /// `{"type": "turn.started", "turn": ...}` and `{"type": "error", ...}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::TurnStarted { turn } => json!({ "type": "turn.started", "turn": turn }),
            Self::Error { message, error } => {
                let mut object = Map::new();
                object.insert("type".to_string(), Value::String("error".to_string()));
                object.insert("message".to_string(), Value::String(message.clone()));
                if let Some(error) = error {
                    object.insert("error".to_string(), error.clone());
                }
                Value::Object(object)
            }
            Self::Message(value) => value.clone(),
        }
    }
}

/// Lazy, one-shot sequence of [`RawEvent`]s for a single turn.
///
/// Ends after `turn/completed` or after a synthetic error, including one for
/// a turn that stays silent longer than the idle bound. Dropping it early
/// releases the client for other requests without touching the subprocess.
pub struct TurnStream {
    inner: Pin<Box<dyn Stream<Item = RawEvent> + Send>>,
}

impl TurnStream {
    pub(crate) fn new(
        connection: Arc<Connection>,
        guard: OwnedMutexGuard<()>,
        thread_id: &str,
        request_id: RequestId,
        response: oneshot::Receiver<Value>,
        start_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let cursor = Cursor {
            connection,
            _guard: guard,
            request_id,
            phase: Phase::AwaitingStart(response),
            thread_id: thread_id.to_string(),
            turn_id: None,
            start_timeout,
            idle_timeout,
        };
        Self {
            inner: Box::pin(stream::unfold(cursor, advance)),
        }
    }
}

impl Stream for TurnStream {
    type Item = RawEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnStream").finish_non_exhaustive()
    }
}

enum Phase {
    AwaitingStart(oneshot::Receiver<Value>),
    Streaming,
    Finished,
}

struct Cursor {
    connection: Arc<Connection>,
    _guard: OwnedMutexGuard<()>,
    request_id: RequestId,
    phase: Phase,
    thread_id: String,
    turn_id: Option<String>,
    start_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Cursor {
    /// Whether a `turn/completed` ends this turn rather than an earlier,
    /// abandoned one on the same process.
    fn owns_completion(&self, message: &Value) -> bool {
        let thread = message.pointer("/params/threadId").and_then(Value::as_str);
        if thread.is_some_and(|thread| thread != self.thread_id) {
            return false;
        }
        let completed = message.pointer("/params/turn/id").and_then(Value::as_str);
        match (self.turn_id.as_deref(), completed) {
            (Some(expected), Some(completed)) => expected == completed,
            _ => true,
        }
    }

    async fn next_message(&self) -> Result<Option<Value>, Duration> {
        let next = self.connection.next_notification();
        match self.idle_timeout {
            Some(bound) => tokio::time::timeout(bound, next).await.map_err(|_| bound),
            None => Ok(next.await),
        }
    }
}

async fn advance(mut cursor: Cursor) -> Option<(RawEvent, Cursor)> {
    loop {
        match std::mem::replace(&mut cursor.phase, Phase::Finished) {
            Phase::Finished => return None,
            Phase::AwaitingStart(response) => {
                let event = match tokio::time::timeout(cursor.start_timeout, response).await {
                    Ok(Ok(response)) => match IncomingMessage::classify(&response) {
                        Some(IncomingMessage::Error { error, .. }) => {
                            tracing::warn!(error = %error, "app_server: turn/start rejected");
                            RawEvent::Error {
                                message: error.message.clone(),
                                error: Some(error.to_value()),
                            }
                        }
                        Some(IncomingMessage::Response { result, .. }) => {
                            let turn = result.get("turn").cloned().unwrap_or_else(|| json!({}));
                            cursor.turn_id = turn.get("id").and_then(Value::as_str).map(str::to_string);
                            if cursor.turn_id.is_none() {
                                tracing::warn!(
                                    thread_id = %cursor.thread_id,
                                    "app_server: turn/start response has no turn id"
                                );
                            }
                            cursor.phase = Phase::Streaming;
                            RawEvent::TurnStarted { turn }
                        }
                        _ => {
                            cursor.phase = Phase::Streaming;
                            RawEvent::TurnStarted { turn: json!({}) }
                        }
                    },
                    Ok(Err(_)) => {
                        tracing::error!("app_server: closed before turn/start response");
                        RawEvent::closed()
                    }
                    Err(_) => {
                        cursor.connection.forget_pending(cursor.request_id).await;
                        tracing::error!(
                            timeout_ms = cursor.start_timeout.as_millis() as u64,
                            "app_server: turn/start timed out"
                        );
                        RawEvent::Error {
                            message: "Timed out waiting for turn/start response".to_string(),
                            error: None,
                        }
                    }
                };
                return Some((event, cursor));
            }
            Phase::Streaming => {
                let message = match cursor.next_message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::error!(turn_id = ?cursor.turn_id, "app_server: closed during turn");
                        return Some((RawEvent::closed(), cursor));
                    }
                    Err(bound) => {
                        tracing::warn!(
                            turn_id = ?cursor.turn_id,
                            idle_ms = bound.as_millis() as u64,
                            "app_server: turn stalled, giving up"
                        );
                        let event = RawEvent::Error {
                            message: STALLED_MESSAGE.to_string(),
                            error: None,
                        };
                        return Some((event, cursor));
                    }
                };

                let method = message.get("method").and_then(Value::as_str);
                if method == Some(TURN_STARTED) && cursor.turn_id.is_none() {
                    cursor.turn_id = message
                        .pointer("/params/turn/id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                if method != Some(TURN_COMPLETED) {
                    cursor.phase = Phase::Streaming;
                    return Some((RawEvent::Message(message), cursor));
                }

                if !cursor.owns_completion(&message) {
                    tracing::debug!(
                        expected = ?cursor.turn_id,
                        completed = ?message.pointer("/params/turn/id"),
                        "app_server: ignoring completion of an earlier turn"
                    );
                    cursor.phase = Phase::Streaming;
                    continue;
                }
                return Some((RawEvent::Message(message), cursor));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_events_keep_their_dict_shape() {
        assert_eq!(
            RawEvent::closed().to_value(),
            json!({ "type": "error", "message": "App-server closed" })
        );
        let started = RawEvent::TurnStarted {
            turn: json!({ "id": "turn_1" }),
        };
        assert_eq!(started.to_value()["type"], "turn.started");
        assert_eq!(started.method(), None);
        assert_eq!(
            RawEvent::Message(json!({ "method": "item/agentMessage/delta" })).method(),
            Some("item/agentMessage/delta")
        );
    }
}
