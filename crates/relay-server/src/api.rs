use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use protocol::{defaults, CommandKind, CommandPayload, CommandResult, CommandStatus};
use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;
use crate::dispatcher::{CommandOutcome, DispatchError, Dispatcher};
use crate::session::auth::AuthToken;
use crate::session::socket::serve_executor;
use crate::store::{Command, CommandStore, StoreError};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;
const PREVIEW_CHARS: usize = 500;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) store: Arc<CommandStore>,
    pub(crate) auth: AuthToken,
    pub(crate) liveness: LivenessConfig,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/commands", get(list_commands).post(submit_command))
        .route("/commands/:id", get(get_command))
        .route(defaults::AGENT_WS_PATH, get(agent_ws))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    // Path only: the agent upgrade carries its token in the query string.
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        event = "http.request",
        method = %method,
        path = %path,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    response
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    executor_connected: bool,
    timestamp: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        executor_connected: state.dispatcher.sessions().is_connected(),
        timestamp: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
    })
}

/// Request body for `POST /commands`. A missing shell timeout takes the
/// configured default.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SubmitBody {
    Shell {
        command: String,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ListDir {
        path: String,
    },
}

impl From<SubmitBody> for CommandPayload {
    fn from(body: SubmitBody) -> Self {
        match body {
            SubmitBody::Shell {
                command,
                working_dir,
                timeout_secs,
            } => CommandPayload::Shell {
                command,
                working_dir,
                timeout_secs: timeout_secs.unwrap_or(0),
            },
            SubmitBody::ReadFile { path } => CommandPayload::ReadFile { path },
            SubmitBody::WriteFile { path, content } => CommandPayload::WriteFile { path, content },
            SubmitBody::ListDir { path } => CommandPayload::ListDir { path },
        }
    }
}

async fn submit_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<CommandOutcome>), StatusCode> {
    authorize(&state, &headers)?;
    match state.dispatcher.submit(body.into()).await {
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome))),
        Err(DispatchError::Timeout { id, secs }) => Ok((
            StatusCode::GATEWAY_TIMEOUT,
            Json(CommandOutcome {
                id,
                status: CommandStatus::Timeout,
                result: CommandResult::error(format!("command timed out after {secs} seconds")),
            }),
        )),
        Err(DispatchError::ShuttingDown) => Err(StatusCode::SERVICE_UNAVAILABLE),
        Err(DispatchError::Store(err)) => {
            tracing::error!(event = "command.store_failed", error = %err);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

/// Listing row. Output and error are cut to a short preview.
#[derive(Debug, Serialize)]
struct CommandRow {
    id: String,
    kind: CommandKind,
    status: CommandStatus,
    summary: String,
    output: Option<String>,
    error: Option<String>,
    exit_code: Option<i32>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl From<Command> for CommandRow {
    fn from(command: Command) -> Self {
        let result = command.result.unwrap_or_default();
        Self {
            summary: preview(&command.payload.summary()),
            id: command.id,
            kind: command.kind,
            status: command.status,
            output: result.output.as_deref().map(preview),
            error: result.error.as_deref().map(preview),
            exit_code: result.exit_code,
            created_at: format_ms(command.created_at_ms),
            started_at: command.started_at_ms.map(format_ms),
            completed_at: command.completed_at_ms.map(format_ms),
        }
    }
}

async fn list_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CommandRow>>, StatusCode> {
    authorize(&state, &headers)?;
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<CommandStatus>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let rows = state
        .store
        .list_recent(limit, status)
        .await
        .into_iter()
        .map(CommandRow::from)
        .collect();
    Ok(Json(rows))
}

async fn get_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Command>, StatusCode> {
    authorize(&state, &headers)?;
    match state.store.get(&id).await {
        Ok(command) => Ok(Json(command)),
        Err(StoreError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            tracing::error!(event = "command.lookup_failed", id = %id, error = %err);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    token: Option<String>,
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<AgentQuery>,
    State(state): State<AppState>,
) -> Response {
    if state.auth.verify(query.token.as_deref()).is_err() {
        tracing::warn!(event = "session.unauthorized", peer = %peer);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let dispatcher = Arc::clone(&state.dispatcher);
    let liveness = state.liveness.clone();
    ws.on_upgrade(move |socket| serve_executor(socket, peer, dispatcher, liveness))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    state
        .auth
        .verify_bearer(header)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn format_ms(ms: u64) -> String {
    let at = UNIX_EPOCH + Duration::from_millis(ms);
    humantime::format_rfc3339_millis(at).to_string()
}
