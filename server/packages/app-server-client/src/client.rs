use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::jsonrpc::{IncomingMessage, OutgoingMessage, RequestId, RpcError};
use crate::launch::LaunchSpec;
use crate::turn::TurnStream;

pub const CLIENT_NAME: &str = "codex_bridge";
const CLIENT_TITLE: &str = "Codex Bridge";
const STDERR_TAIL_LINES: usize = 64;
const LOG_LINE_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to spawn app-server `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture app-server stdin")]
    MissingStdin,
    #[error("failed to capture app-server stdout")]
    MissingStdout,
    #[error("failed to capture app-server stderr")]
    MissingStderr,
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write app-server stdin: {0}")]
    Write(#[source] std::io::Error),
    #[error("app-server closed before answering {method}")]
    Closed { method: String },
    #[error("app-server is not started")]
    NotStarted,
    #[error("timeout waiting for {method} response")]
    Timeout { method: String },
    #[error("timeout waiting for a previous app-server operation before {method}")]
    Busy { method: String },
    #[error("{method} failed: {error}")]
    Rpc { method: String, error: RpcError },
    #[error("app-server initialize failed: {0}")]
    Handshake(String),
    #[error("app-server authentication failed: {error}")]
    Authentication { error: RpcError },
}

impl ClientError {
    /// Errors after which the subprocess must be considered unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Rpc { .. } | Self::Timeout { .. } | Self::Busy { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Sent with `account/login/start` during the handshake when set.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    /// SIGTERM to SIGKILL grace period used by [`AppServerClient::close`].
    pub shutdown_grace: Duration,
    /// Longest gap between two turn notifications before the turn is given
    /// up with a synthetic error. `None` waits for as long as the process
    /// lives.
    pub turn_idle_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            request_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            turn_idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// JSON-RPC client for one `codex app-server` subprocess.
///
/// Requests are never pipelined: `op_lock` is held from the moment a request
/// line is written until its response is read, and for the whole life of a
/// [`TurnStream`]. Waiting for it is bounded by the request timeout.
#[derive(Debug)]
pub struct AppServerClient {
    launch: LaunchSpec,
    options: ClientOptions,
    next_id: AtomicI64,
    start_lock: Mutex<()>,
    op_lock: Arc<Mutex<()>>,
    connection: std::sync::Mutex<Option<Arc<Connection>>>,
}

impl AppServerClient {
    pub fn new(launch: LaunchSpec, options: ClientOptions) -> Self {
        Self {
            launch,
            options,
            next_id: AtomicI64::new(0),
            start_lock: Mutex::new(()),
            op_lock: Arc::new(Mutex::new(())),
            connection: std::sync::Mutex::new(None),
        }
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Spawns the subprocess and runs the handshake unless a live one exists.
    /// Concurrent callers wait for the same spawn.
    pub async fn ensure_started(&self) -> Result<(), ClientError> {
        let _start = self.start_lock.lock().await;
        if self.is_alive() {
            return Ok(());
        }

        if let Some(stale) = self.take_connection() {
            tracing::info!(pid = ?stale.pid, "app_server: replacing exited process");
            stale.shutdown(self.options.shutdown_grace).await;
        }

        let connection = Arc::new(Connection::spawn(&self.launch)?);
        let handshake = match self.acquire_op("initialize").await {
            Ok(_op) => self.handshake(&connection).await,
            Err(err) => Err(err),
        };
        if let Err(err) = handshake {
            tracing::error!(pid = ?connection.pid, error = %err, "app_server: handshake failed");
            connection.shutdown(self.options.shutdown_grace).await;
            return Err(err);
        }

        tracing::info!(
            pid = ?connection.pid,
            elapsed_ms = connection.spawned_at.elapsed().as_millis() as u64,
            "app_server: initialized"
        );
        *lock_unpoisoned(&self.connection) = Some(connection);
        Ok(())
    }

    async fn handshake(&self, connection: &Connection) -> Result<(), ClientError> {
        let params = json!({
            "clientInfo": {
                "name": CLIENT_NAME,
                "title": CLIENT_TITLE,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.request_on(connection, "initialize", Some(&params))
            .await
            .map_err(|err| match err {
                ClientError::Rpc { error, .. } => ClientError::Handshake(error.to_string()),
                other => other,
            })?;
        connection
            .write(&OutgoingMessage::notification("initialized", None))
            .await?;

        if let Some(api_key) = &self.options.api_key {
            let params = json!({ "type": "apiKey", "apiKey": api_key });
            self.request_on(connection, "account/login/start", Some(&params))
                .await
                .map_err(|err| match err {
                    ClientError::Rpc { error, .. } => ClientError::Authentication { error },
                    other => other,
                })?;
            tracing::info!(pid = ?connection.pid, "app_server: authenticated with api key");
        }
        Ok(())
    }

    /// Sends one request and waits for its response. Notifications read in the
    /// meantime are discarded.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let connection = self.live_connection(method)?;
        let _op = self.acquire_op(method).await?;
        self.request_on(&connection, method, params.as_ref()).await
    }

    async fn acquire_op(&self, method: &str) -> Result<OwnedMutexGuard<()>, ClientError> {
        let timeout = self.options.request_timeout;
        match tokio::time::timeout(timeout, self.op_lock.clone().lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(
                    method = %method,
                    timeout_ms = timeout.as_millis() as u64,
                    "app_server: client busy, giving up"
                );
                Err(ClientError::Busy {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn request_on(
        &self,
        connection: &Connection,
        method: &str,
        params: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let started = Instant::now();
        let id = self.next_request_id();
        let rx = connection.register(method, id).await?;

        tracing::debug!(method = %method, id = id, "app_server: request");
        if let Err(err) = connection
            .write(&OutgoingMessage::request(method, id, params))
            .await
        {
            connection.pending.lock().await.remove(&id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                tracing::error!(method = %method, id = id, "app_server: closed while awaiting response");
                return Err(ClientError::Closed {
                    method: method.to_string(),
                });
            }
            Err(_) => {
                connection.pending.lock().await.remove(&id);
                tracing::error!(
                    method = %method,
                    id = id,
                    timeout_ms = self.options.request_timeout.as_millis() as u64,
                    "app_server: request timed out"
                );
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                });
            }
        };
        connection.discard_notifications(method).await;

        tracing::debug!(
            method = %method,
            id = id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "app_server: response"
        );
        match IncomingMessage::classify(&response) {
            Some(IncomingMessage::Error { error, .. }) => Err(ClientError::Rpc {
                method: method.to_string(),
                error,
            }),
            Some(IncomingMessage::Response { result, .. }) => Ok(result),
            _ => Ok(Value::Null),
        }
    }

    /// Writes a notification; nothing is awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let connection = self.live_connection(method)?;
        connection
            .write(&OutgoingMessage::notification(method, params.as_ref()))
            .await
    }

    /// Starts a turn and returns its event stream. The stream holds this
    /// client's request lock until it finishes or is dropped.
    pub async fn stream_turn(
        &self,
        thread_id: &str,
        prompt: &str,
        model: Option<&str>,
    ) -> Result<TurnStream, ClientError> {
        const METHOD: &str = "turn/start";

        let connection = self.live_connection(METHOD)?;
        let guard = self.acquire_op(METHOD).await?;
        connection.discard_notifications(METHOD).await;

        let mut params = json!({
            "threadId": thread_id,
            "input": [{ "type": "text", "text": prompt }],
        });
        if let Some(model) = model {
            params["model"] = Value::String(model.to_string());
        }

        let id = self.next_request_id();
        let response = connection.register(METHOD, id).await?;
        tracing::debug!(thread_id = %thread_id, id = id, "app_server: starting turn");
        if let Err(err) = connection
            .write(&OutgoingMessage::request(METHOD, id, Some(&params)))
            .await
        {
            connection.pending.lock().await.remove(&id);
            return Err(err);
        }

        Ok(TurnStream::new(
            connection,
            guard,
            thread_id,
            id,
            response,
            self.options.request_timeout,
            self.options.turn_idle_timeout,
        ))
    }

    pub async fn thread_start(&self, model: Option<&str>) -> Result<Value, ClientError> {
        let mut params = json!({ "approvalPolicy": "never" });
        if let Some(model) = model {
            params["model"] = Value::String(model.to_string());
        }
        self.request("thread/start", Some(params)).await
    }

    pub async fn thread_resume(&self, thread_id: &str) -> Result<Value, ClientError> {
        self.request("thread/resume", Some(json!({ "threadId": thread_id })))
            .await
    }

    pub async fn thread_list(&self, limit: u32, cursor: Option<&str>) -> Result<Value, ClientError> {
        let mut params = json!({ "limit": limit, "sortKey": "created_at" });
        if let Some(cursor) = cursor {
            params["cursor"] = Value::String(cursor.to_string());
        }
        self.request("thread/list", Some(params)).await
    }

    pub async fn thread_read(&self, thread_id: &str) -> Result<Value, ClientError> {
        self.request(
            "thread/read",
            Some(json!({ "threadId": thread_id, "includeTurns": true })),
        )
        .await
    }

    pub fn is_alive(&self) -> bool {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .is_some_and(|connection| connection.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        lock_unpoisoned(&self.connection)
            .as_ref()
            .and_then(|connection| connection.pid)
    }

    /// Collects the subprocess's buffered stderr tail. When the process has
    /// already exited, waits up to `bound` for its stderr to reach EOF first.
    pub async fn drain_diagnostics(&self, bound: Duration) -> Vec<String> {
        let connection = lock_unpoisoned(&self.connection).clone();
        let Some(connection) = connection else {
            return Vec::new();
        };
        if !connection.is_alive() {
            let mut done = connection.stderr_done.clone();
            let _ = tokio::time::timeout(bound, done.wait_for(|finished| *finished)).await;
        }
        let tail = lock_unpoisoned(&connection.stderr_tail).drain(..).collect();
        tail
    }

    /// Terminates the subprocess (SIGTERM, then SIGKILL after the grace
    /// period). Idempotent.
    pub async fn close(&self) {
        let _start = self.start_lock.lock().await;
        if let Some(connection) = self.take_connection() {
            connection.shutdown(self.options.shutdown_grace).await;
        }
    }

    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_connection(&self) -> Option<Arc<Connection>> {
        lock_unpoisoned(&self.connection).take()
    }

    fn live_connection(&self, method: &str) -> Result<Arc<Connection>, ClientError> {
        match lock_unpoisoned(&self.connection).as_ref() {
            Some(connection) if !connection.is_closed() => Ok(connection.clone()),
            Some(_) => Err(ClientError::Closed {
                method: method.to_string(),
            }),
            None => Err(ClientError::NotStarted),
        }
    }
}

/// One spawned subprocess and the tasks reading its pipes.
#[derive(Debug)]
pub(crate) struct Connection {
    pid: Option<u32>,
    spawned_at: Instant,
    stdin: Mutex<ChildStdin>,
    child: std::sync::Mutex<Option<Child>>,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Value>>>>,
    notifications: Mutex<mpsc::UnboundedReceiver<Value>>,
    closed: Arc<AtomicBool>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    stderr_done: watch::Receiver<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    fn spawn(launch: &LaunchSpec) -> Result<Self, ClientError> {
        let spawned_at = Instant::now();
        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|error| {
            tracing::error!(
                program = ?launch.program,
                args = ?launch.args,
                error = %error,
                "app_server: spawn failed"
            );
            ClientError::Spawn {
                command: launch.display_command(),
                error,
            }
        })?;
        let pid = child.id();
        tracing::info!(pid = ?pid, command = %launch.display_command(), "app_server: spawned");

        let stdin = child.stdin.take().ok_or(ClientError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(ClientError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(ClientError::MissingStderr)?;

        let pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
            STDERR_TAIL_LINES,
        )));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let reader = spawn_stdout_loop(stdout, pending.clone(), notify_tx, closed.clone(), pid);
        let diagnostics = spawn_stderr_loop(stderr, stderr_tail.clone(), done_tx, pid);

        Ok(Self {
            pid,
            spawned_at,
            stdin: Mutex::new(stdin),
            child: std::sync::Mutex::new(Some(child)),
            pending,
            notifications: Mutex::new(notify_rx),
            closed,
            stderr_tail,
            stderr_done: done_rx,
            tasks: std::sync::Mutex::new(vec![reader, diagnostics]),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match lock_unpoisoned(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Registers a pending slot for `id`. Fails when the reader has already
    /// seen EOF, since nobody would ever complete the slot.
    async fn register(
        &self,
        method: &str,
        id: RequestId,
    ) -> Result<oneshot::Receiver<Value>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed {
                method: method.to_string(),
            });
        }
        Ok(rx)
    }

    async fn write(&self, message: &OutgoingMessage<'_>) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed {
                method: message.method.to_string(),
            });
        }
        let mut bytes = serde_json::to_vec(message).map_err(ClientError::Serialize)?;
        bytes.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let result = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        result.map_err(|err| {
            // A broken pipe means the process is gone for good.
            self.closed.store(true, Ordering::SeqCst);
            tracing::error!(
                pid = ?self.pid,
                method = %message.method,
                error = %err,
                "app_server: stdin write failed"
            );
            ClientError::Write(err)
        })
    }

    pub(crate) async fn forget_pending(&self, id: RequestId) {
        self.pending.lock().await.remove(&id);
    }

    pub(crate) async fn next_notification(&self) -> Option<Value> {
        self.notifications.lock().await.recv().await
    }

    async fn discard_notifications(&self, context: &str) {
        let mut receiver = self.notifications.lock().await;
        let mut discarded = 0usize;
        while let Ok(message) = receiver.try_recv() {
            discarded += 1;
            tracing::debug!(
                context = %context,
                method = message.get("method").and_then(serde_json::Value::as_str).unwrap_or("<none>"),
                "app_server: discarding notification"
            );
        }
        if discarded > 0 {
            tracing::debug!(context = %context, discarded, "app_server: discarded queued notifications");
        }
    }

    async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let child = lock_unpoisoned(&self.child).take();
        if let Some(mut child) = child {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid = ?self.pid, code = status.code(), "app_server: already exited");
                }
                _ => {
                    tracing::info!(
                        pid = ?self.pid,
                        age_ms = self.spawned_at.elapsed().as_millis() as u64,
                        "app_server: terminating"
                    );
                    request_terminate(&mut child);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(_) => {}
                        Err(_) => {
                            tracing::warn!(
                                pid = ?self.pid,
                                grace_ms = grace.as_millis() as u64,
                                "app_server: did not exit within grace period, killing"
                            );
                            let _ = child.kill().await;
                        }
                    }
                }
            }
        }

        self.pending.lock().await.clear();
        for task in lock_unpoisoned(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a pid we spawned and still own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn spawn_stdout_loop(
    stdout: ChildStdout,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Value>>>>,
    notifications: mpsc::UnboundedSender<Value>,
    closed: Arc<AtomicBool>,
    pid: Option<u32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut line_count: u64 = 0;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(pid = ?pid, error = %err, "app_server: stdout read failed");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            line_count += 1;

            let payload = match serde_json::from_str::<Value>(trimmed) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(
                        pid = ?pid,
                        error = %err,
                        line_number = line_count,
                        raw = %truncate(trimmed, LOG_LINE_LIMIT),
                        "app_server: invalid json on stdout"
                    );
                    continue;
                }
            };

            let has_method = payload.get("method").is_some();
            match payload.get("id") {
                Some(id) if !has_method => {
                    let sender = match id.as_i64() {
                        Some(id) => pending.lock().await.remove(&id),
                        None => None,
                    };
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(payload);
                        }
                        None => {
                            tracing::warn!(pid = ?pid, id = %id, "app_server: orphan response");
                        }
                    }
                }
                _ if has_method => {
                    let _ = notifications.send(payload);
                }
                _ => {
                    tracing::warn!(
                        pid = ?pid,
                        raw = %truncate(trimmed, LOG_LINE_LIMIT),
                        "app_server: message with neither id nor method"
                    );
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        pending.lock().await.clear();
        tracing::info!(pid = ?pid, total_lines = line_count, "app_server: stdout closed");
    })
}

fn spawn_stderr_loop(
    stderr: ChildStderr,
    tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    done: watch::Sender<bool>,
    pid: Option<u32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid = ?pid, "app_server: stderr: {}", line);
            let mut buffer = lock_unpoisoned(&tail);
            if buffer.len() == STDERR_TAIL_LINES {
                buffer.pop_front();
            }
            buffer.push_back(line);
        }
        let _ = done.send(true);
    })
}

fn truncate(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &value[..index]),
        None => value.to_string(),
    }
}

fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("héllo", 2), "hé...");
    }

    #[test]
    fn rpc_errors_are_not_fatal() {
        let rpc = ClientError::Rpc {
            method: "thread/read".to_string(),
            error: RpcError {
                code: Some(-32600),
                message: "thread not found".to_string(),
                data: None,
            },
        };
        assert!(!rpc.is_fatal());
        assert_eq!(rpc.to_string(), "thread/read failed: thread not found (code -32600)");
        assert!(ClientError::Closed {
            method: "turn/start".to_string()
        }
        .is_fatal());
    }

    #[tokio::test]
    async fn requests_before_start_are_rejected() {
        let client = AppServerClient::new(LaunchSpec::app_server("codex"), ClientOptions::default());
        assert!(!client.is_alive());
        assert!(matches!(
            client.request("thread/list", None).await,
            Err(ClientError::NotStarted)
        ));
        client.close().await;
    }
}
