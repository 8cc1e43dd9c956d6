use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use codex_bridge_agui::{
    AguiMessage, AguiResponse, ContentObject, HistoryFunction, HistoryMessage, HistoryResponse,
    HistoryToolCall, ProtocolVersion, ResponseMetadata, ResponseStatus,
};
use codex_bridge_error::{BridgeError, ErrorType, ProblemDetails};
use futures::{stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::bridge::{Bridge, ThreadInfo, ThreadsResponse, DEFAULT_THREAD_LIMIT};
use crate::user_env::{validate_user_id, DEFAULT_USER};

pub const USER_ID_HEADER: &str = "x-user-id";
const SSE_DONE: &str = "[DONE]";
const CAPACITY_RETRY_AFTER_SECS: &str = "30";

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    bridge: Bridge,
}

impl AppState {
    pub fn new(auth: AuthConfig, bridge: Bridge) -> Self {
        Self { auth, bridge }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut api_router = Router::new()
        .route("/threads", get(list_threads))
        .route("/history", get(get_history))
        .route("/chat", post(post_chat))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        api_router = api_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/status", get(get_status))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone())
        .merge(api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("CODEX_BRIDGE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                let user_id = req
                    .headers()
                    .get(USER_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or(DEFAULT_USER)
                    .to_string();
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri(),
                    user_id = %user_id
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.bridge.broker().shutdown_all().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(get_status, list_threads, get_history, post_chat),
    components(
        schemas(
            StatusResponse,
            ThreadInfo,
            ThreadsResponse,
            HistoryResponse,
            HistoryMessage,
            HistoryToolCall,
            HistoryFunction,
            ChatMessage,
            ChatRequest,
            ProtocolVersion,
            AguiResponse,
            AguiMessage,
            ContentObject,
            ResponseMetadata,
            ResponseStatus,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "threads", description = "Conversation threads"),
        (name = "chat", description = "Turns")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Bridge(err) = &self;
        let problem = err.to_problem_details();
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(problem)).into_response();
        if err.error_type() == ErrorType::Capacity {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(CAPACITY_RETRY_AFTER_SECS),
            );
        }
        response
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct StatusResponse {
    /// `ok`, `degraded` or `unavailable`.
    pub status: String,
    pub codex_available: bool,
    #[serde(default)]
    pub codex_version: Option<String>,
    pub api_key_configured: bool,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatRequest {
    /// Absent to start a new thread.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub protocol: ProtocolVersion,
}

impl ChatRequest {
    /// Non-empty message contents joined by newlines.
    pub fn prompt(&self) -> String {
        self.messages
            .iter()
            .map(|message| message.content.as_str())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn default_role() -> String {
    "user".to_string()
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ThreadsQuery {
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    thread_id: String,
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = match &state.auth.token {
        Some(token) => token.as_str(),
        None => return Ok(next.run(req).await),
    };

    let provided = extract_token(req.headers());
    if provided.as_deref() == Some(expected) {
        Ok(next.run(req).await)
    } else {
        Err(BridgeError::TokenInvalid {
            message: Some("missing or invalid token".to_string()),
        }
        .into())
    }
}

/// Accepts `Bearer`/`Token` credentials, or the password half of `Basic`.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    let rest = rest.trim();
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.to_string()),
        "basic" => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(rest)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())?;
            match decoded.split_once(':') {
                Some((_, password)) => Some(password.to_string()),
                None => (!decoded.is_empty()).then_some(decoded),
            }
        }
        _ => None,
    }
}

fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    let user_id = match headers.get(USER_ID_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|_| BridgeError::InvalidRequest {
                message: "X-User-Id must be ASCII".to_string(),
            })?
            .trim()
            .to_string(),
        None => DEFAULT_USER.to_string(),
    };
    validate_user_id(&user_id)?;
    Ok(user_id)
}

async fn get_root() -> Json<Value> {
    Json(json!({
        "name": "Codex Bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /chat": "Send message (new or continue)",
            "GET /threads": "List conversations",
            "GET /history": "Get conversation history",
            "GET /status": "Health check",
            "GET /openapi.json": "OpenAPI document",
        }
    }))
}

async fn not_found() -> (StatusCode, Json<ProblemDetails>) {
    let mut problem = ProblemDetails::new(ErrorType::InvalidRequest, Some("no such route".to_string()));
    problem.status = StatusCode::NOT_FOUND.as_u16();
    (StatusCode::NOT_FOUND, Json(problem))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/status",
    responses((status = 200, body = StatusResponse)),
    tag = "meta"
)]
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (available, version) = state.bridge.check_availability().await;
    let api_key_configured = state.bridge.api_key_configured();
    let status = match (available, api_key_configured) {
        (true, true) => "ok",
        (true, false) | (false, true) => "degraded",
        (false, false) => "unavailable",
    };
    Json(StatusResponse {
        status: status.to_string(),
        codex_available: available,
        codex_version: version,
        api_key_configured,
        active_sessions: state.bridge.broker().active_session_count().await,
    })
}

#[utoipa::path(
    get,
    path = "/threads",
    params(
        ("limit" = Option<u32>, Query, description = "Page size, 1 to 200 (default 50)"),
        ("cursor" = Option<String>, Query, description = "Cursor from a previous page"),
        ("X-User-Id" = Option<String>, Header, description = "User identity")
    ),
    responses(
        (status = 200, body = ThreadsResponse),
        (status = 400, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn list_threads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<ThreadsResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let limit = query.limit.unwrap_or(DEFAULT_THREAD_LIMIT);
    let threads = state
        .bridge
        .list_threads(&user_id, limit, query.cursor.as_deref())
        .await?;
    Ok(Json(threads))
}

#[utoipa::path(
    get,
    path = "/history",
    params(
        ("thread_id" = String, Query, description = "Thread id"),
        ("X-User-Id" = Option<String>, Header, description = "User identity")
    ),
    responses(
        (status = 200, body = HistoryResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "threads"
)]
async fn get_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let history = state.bridge.read_history(&user_id, &query.thread_id).await?;
    Ok(Json(history))
}

#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequest,
    params(("X-User-Id" = Option<String>, Header, description = "User identity")),
    responses(
        (status = 200, description = "SSE event stream, or an AguiResponse when stream is false", body = AguiResponse),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let user_id = user_id(&headers)?;
    tracing::info!(
        user_id = %user_id,
        thread_id = ?request.thread_id,
        messages = request.messages.len(),
        "chat: request"
    );

    let prompt = request.prompt();
    if prompt.trim().is_empty() {
        return Err(BridgeError::InvalidRequest {
            message: "Empty message".to_string(),
        }
        .into());
    }

    if !request.stream {
        let response = state
            .bridge
            .run_turn(
                &user_id,
                request.thread_id.as_deref(),
                &prompt,
                request.model.as_deref(),
            )
            .await?;
        return Ok(Json(response).into_response());
    }

    let turn = state
        .bridge
        .start_or_resume_turn(
            &user_id,
            request.thread_id.as_deref(),
            &prompt,
            request.model.as_deref(),
            request.protocol,
        )
        .await?;
    tracing::debug!(thread_id = %turn.thread_id, "chat: streaming turn");

    let frames = turn
        .events
        .map(|value| Ok::<_, Infallible>(Event::default().data(value.to_string())))
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().data(SSE_DONE))
        }));
    let headers = [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        ),
    ];
    Ok((headers, Sse::new(frames)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).expect("header value"));
        }
        map
    }

    #[test]
    fn prompt_joins_non_empty_messages() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "content": "" },
                { "content": "list files" }
            ]
        }))
        .expect("chat request");
        assert_eq!(request.prompt(), "be brief\nlist files");
        assert!(request.stream);
        assert_eq!(request.protocol, ProtocolVersion::Legacy);
        assert_eq!(request.messages[1].role, "user");
    }

    #[test]
    fn tokens_are_read_from_bearer_and_basic() {
        assert_eq!(
            extract_token(&headers(&[("authorization", "Bearer s3cret")])).as_deref(),
            Some("s3cret")
        );
        // "user:s3cret"
        assert_eq!(
            extract_token(&headers(&[("authorization", "Basic dXNlcjpzM2NyZXQ=")])).as_deref(),
            Some("s3cret")
        );
        assert_eq!(extract_token(&headers(&[("authorization", "Digest x")])), None);
        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn missing_user_header_is_the_default_user() {
        assert_eq!(user_id(&HeaderMap::new()).expect("user"), DEFAULT_USER);
        assert_eq!(
            user_id(&headers(&[(USER_ID_HEADER, " alice ")])).expect("user"),
            "alice"
        );
        assert!(user_id(&headers(&[(USER_ID_HEADER, "../etc")])).is_err());
    }
}
