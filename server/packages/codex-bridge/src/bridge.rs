use std::pin::Pin;
use std::sync::Arc;

use codex_bridge_agui::{
    finish_unterminated, to_wire, translate, AguiEvent, AguiResponse, HistoryResponse,
    ProtocolVersion, TurnContext, TurnState,
};
use codex_bridge_app_server_client::{check_availability, AppServerClient, ClientError, RawEvent};
use codex_bridge_error::BridgeError;
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

use crate::broker::{SessionBroker, TurnActivity};

pub const DEFAULT_THREAD_LIMIT: u32 = 50;
pub const MAX_THREAD_LIMIT: u32 = 200;
const EVENT_BUFFER: usize = 64;

/// Serialized external events of one turn, terminal event last.
pub type EventStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

pub struct StartedTurn {
    /// Always the id reported by the app-server.
    pub thread_id: String,
    pub events: EventStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadInfo {
    pub thread_id: String,
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadsResponse {
    pub threads: Vec<ThreadInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Core operations behind the HTTP surface: every call resolves the user's
/// app-server through the broker first.
#[derive(Debug, Clone)]
pub struct Bridge {
    broker: SessionBroker,
    api_key_configured: bool,
}

impl Bridge {
    pub fn new(broker: SessionBroker) -> Self {
        let api_key_configured = broker.config().client.api_key.is_some();
        Self {
            broker,
            api_key_configured,
        }
    }

    pub fn broker(&self) -> &SessionBroker {
        &self.broker
    }

    pub fn api_key_configured(&self) -> bool {
        self.api_key_configured
    }

    /// Opens (or resumes) a thread and streams one turn on it. Failures
    /// before the thread is known are returned; failures after that arrive
    /// as an error event followed by the terminal event.
    pub async fn start_or_resume_turn(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        prompt: &str,
        model: Option<&str>,
        protocol: ProtocolVersion,
    ) -> Result<StartedTurn, BridgeError> {
        let client = self.broker.get_client(user_id).await?;
        let activity = self.broker.begin_turn(user_id).await;
        let thread_id = self.open_thread(&client, thread_id, model).await?;

        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let pump = TurnPump {
            activity,
            client,
            user_id: user_id.to_string(),
            context: TurnContext::new(thread_id.clone()),
            protocol,
            sender,
        };
        let prompt = prompt.to_string();
        let model = model.map(str::to_string);
        tokio::spawn(async move { pump.run(&prompt, model.as_deref()).await });

        Ok(StartedTurn {
            thread_id,
            events: Box::pin(ReceiverStream::new(receiver)),
        })
    }

    /// Non-streaming variant: runs the turn to its end and aggregates the
    /// completed items.
    pub async fn run_turn(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<AguiResponse, BridgeError> {
        let client = self.broker.get_client(user_id).await?;
        let activity = self.broker.begin_turn(user_id).await;
        let thread_id = self.open_thread(&client, thread_id, model).await?;

        let raw_events = match client.stream_turn(&thread_id, prompt, model).await {
            Ok(turn) => {
                turn.inspect(|_| {
                    if let Some(activity) = &activity {
                        activity.touch();
                    }
                })
                .collect::<Vec<_>>()
                .await
            }
            Err(err) => {
                tracing::error!(user_id = %user_id, thread_id = %thread_id, error = %err, "bridge: failed to start turn");
                vec![RawEvent::Error {
                    message: err.to_string(),
                    error: None,
                }]
            }
        };
        drop(activity);
        Ok(AguiResponse::from_raw_events(&raw_events, &thread_id, user_id))
    }

    pub async fn list_threads(
        &self,
        user_id: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ThreadsResponse, BridgeError> {
        if !(1..=MAX_THREAD_LIMIT).contains(&limit) {
            return Err(BridgeError::InvalidRequest {
                message: format!("limit must be between 1 and {MAX_THREAD_LIMIT}"),
            });
        }
        tracing::info!(user_id = %user_id, limit = limit, "bridge: listing threads");

        let client = self.broker.get_client(user_id).await?;
        let result = client
            .thread_list(limit, cursor)
            .await
            .map_err(map_client_error)?;

        let threads = result
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|item| ThreadInfo {
                thread_id: item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                preview: item.get("preview").and_then(Value::as_str).map(str::to_string),
                created_at: item.get("createdAt").and_then(epoch_to_rfc3339),
                updated_at: item.get("updatedAt").and_then(epoch_to_rfc3339),
            })
            .collect();

        Ok(ThreadsResponse {
            threads,
            next_cursor: result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub async fn read_history(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> Result<HistoryResponse, BridgeError> {
        tracing::info!(user_id = %user_id, thread_id = %thread_id, "bridge: reading history");
        let client = self.broker.get_client(user_id).await?;
        let result = client
            .thread_read(thread_id)
            .await
            .map_err(|err| thread_error(err, thread_id))?;
        let thread = result.get("thread").cloned().unwrap_or(Value::Null);
        Ok(HistoryResponse::from_thread(&thread, thread_id, user_id))
    }

    /// Probes the configured binary with `--version`.
    pub async fn check_availability(&self) -> (bool, Option<String>) {
        let binary = self.broker.environment().binary_path();
        check_availability(&binary).await
    }

    async fn open_thread(
        &self,
        client: &AppServerClient,
        thread_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, BridgeError> {
        let (result, action) = match thread_id {
            Some(requested) => {
                tracing::debug!(thread_id = %requested, "bridge: resuming thread");
                let result = client
                    .thread_resume(requested)
                    .await
                    .map_err(|err| thread_error(err, requested))?;
                (result, "resume")
            }
            None => {
                let result = client
                    .thread_start(model)
                    .await
                    .map_err(map_client_error)?;
                (result, "create")
            }
        };

        let thread_id = result
            .pointer("/thread/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BridgeError::Internal {
                message: format!("failed to {action} thread"),
            })?;
        if action == "create" {
            tracing::info!(thread_id = %thread_id, "bridge: created thread");
        }
        Ok(thread_id.to_string())
    }
}

/// Drives one turn in the background and forwards its serialized events.
/// Stops early, without touching the subprocess, once the receiver is gone;
/// dropping the turn stream then frees the client for other requests.
struct TurnPump {
    activity: Option<TurnActivity>,
    client: Arc<AppServerClient>,
    user_id: String,
    context: TurnContext,
    protocol: ProtocolVersion,
    sender: mpsc::Sender<Value>,
}

impl TurnPump {
    async fn run(self, prompt: &str, model: Option<&str>) {
        let mut state = TurnState::new();
        if !self.emit(&[AguiEvent::RunStarted]).await {
            return;
        }

        match self
            .client
            .stream_turn(&self.context.thread_id, prompt, model)
            .await
        {
            Ok(mut turn) => loop {
                let next = tokio::select! {
                    raw = turn.next() => raw,
                    _ = self.sender.closed() => {
                        tracing::debug!(thread_id = %self.context.thread_id, "bridge: turn stream abandoned");
                        return;
                    }
                };
                let Some(raw) = next else {
                    break;
                };
                if let Some(activity) = &self.activity {
                    activity.touch();
                }
                let events = translate(&raw, &mut state);
                if !self.emit(&events).await {
                    tracing::debug!(thread_id = %self.context.thread_id, "bridge: turn stream abandoned");
                    return;
                }
                if state.finished {
                    break;
                }
            },
            Err(err) => {
                tracing::error!(
                    user_id = %self.user_id,
                    thread_id = %self.context.thread_id,
                    error = %err,
                    "bridge: failed to start turn"
                );
                let raw = RawEvent::Error {
                    message: err.to_string(),
                    error: None,
                };
                let events = translate(&raw, &mut state);
                self.emit(&events).await;
            }
        }

        let events = finish_unterminated(&mut state);
        self.emit(&events).await;
    }

    async fn emit(&self, events: &[AguiEvent]) -> bool {
        for event in events {
            for value in to_wire(event, &self.context, self.protocol) {
                if self.sender.send(value).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}

pub fn map_client_error(err: ClientError) -> BridgeError {
    match err {
        ClientError::Rpc { method, error } => BridgeError::Protocol {
            method,
            code: error.code,
            message: error.message,
            data: error.data,
        },
        ClientError::Timeout { method } => BridgeError::Timeout {
            message: Some(format!("timed out waiting for {method} response")),
        },
        ClientError::Busy { method } => BridgeError::Timeout {
            message: Some(format!(
                "timed out waiting for a running turn to finish before {method}"
            )),
        },
        other => BridgeError::Transport {
            message: other.to_string(),
        },
    }
}

/// Like [`map_client_error`], but a "not found" protocol error becomes
/// [`BridgeError::ThreadNotFound`].
fn thread_error(err: ClientError, thread_id: &str) -> BridgeError {
    let mapped = map_client_error(err);
    if mapped.is_not_found() {
        BridgeError::ThreadNotFound {
            thread_id: thread_id.to_string(),
        }
    } else {
        mapped
    }
}

pub(crate) fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn epoch_to_rfc3339(value: &Value) -> Option<String> {
    let seconds = value
        .as_i64()
        .or_else(|| value.as_f64().map(|seconds| seconds as i64))?;
    if seconds == 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(seconds)
        .ok()
        .map(format_rfc3339)
}
