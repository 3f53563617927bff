//! HTTP API
//!
//! Thin CRUD and command routes over the core. Handlers validate inputs and
//! map errors to status codes; all real work happens in the registry, the
//! session manager, and the turn store.

use crate::error::{Error, Result};
use crate::gateway::AppState;
use crate::turns::METHOD_TURN_INTERRUPT;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

/// REST routes, mounted next to the `/ws` endpoint
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/repos", get(list_repos).post(add_repo))
        .route("/api/repos/:id", delete(remove_repo))
        .route("/api/repos/:id/status", get(repo_status))
        .route("/api/repos/:id/start", post(start_session))
        .route("/api/repos/:id/stop", post(stop_session))
        .route("/api/repos/:id/rpc", post(forward_rpc))
        .route("/api/repos/:id/turns/:turn_id/cancel", post(cancel_turn))
}

/// Outcome of a cancel-turn command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The turn was already terminal; no interrupt was sent
    AlreadyFinished,
    /// A `turn/interrupt` request was issued to the agent
    InterruptSent,
}

/// Cancel a turn, short-circuiting on the turn store: a turn already
/// recorded as terminal is reported without touching the session.
pub async fn cancel_turn_op(
    state: &AppState,
    repo_id: &str,
    turn_id: &str,
) -> Result<CancelOutcome> {
    if let Some(status) = state.turns.get(repo_id, turn_id).await {
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
    }

    let session = state
        .manager
        .connected_session(repo_id)
        .await
        .ok_or_else(|| Error::Session(format!("No active session for repo {repo_id}")))?;
    session
        .request(METHOD_TURN_INTERRUPT, Some(json!({ "turnId": turn_id })))
        .await?;
    Ok(CancelOutcome::InterruptSent)
}

fn error_response(e: Error) -> Response {
    let status = match &e {
        Error::UnknownRepo(_) => StatusCode::NOT_FOUND,
        Error::Registry(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::RpcTimeout(_) | Error::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn list_repos(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

#[derive(Debug, Deserialize)]
struct AddRepoRequest {
    path: PathBuf,
    name: Option<String>,
}

async fn add_repo(
    State(state): State<AppState>,
    Json(request): Json<AddRepoRequest>,
) -> Response {
    match state.registry.add(request.path, request.name) {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn remove_repo(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.registry.get(&id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }

    // the session must die before the registry entry does
    if let Err(e) = state.manager.stop(&id).await {
        tracing::warn!(repo_id = %id, "Failed to stop session during removal: {}", e);
    }

    match state.registry.remove(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn repo_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.registry.get(&id).is_none() {
        return error_response(Error::UnknownRepo(id));
    }
    let status = state.manager.get_status(&id).await;
    Json(json!({ "repoId": id, "status": status })).into_response()
}

async fn start_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_or_start(&id).await {
        Ok(session) => {
            Json(json!({ "repoId": id, "status": session.status() })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.stop(&id).await {
        Ok(()) => Json(json!({ "repoId": id, "status": "stopped" })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RpcForwardRequest {
    method: String,
    params: Option<Value>,
}

/// Send a request through the repo's session and return the agent's result
async fn forward_rpc(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RpcForwardRequest>,
) -> Response {
    let session = match state.manager.get_or_start(&id).await {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };
    match session.request(&request.method, request.params).await {
        Ok(result) => Json(json!({ "result": result })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_turn(
    State(state): State<AppState>,
    Path((id, turn_id)): Path<(String, String)>,
) -> Response {
    match cancel_turn_op(&state, &id, &turn_id).await {
        Ok(outcome) => Json(json!({ "outcome": outcome })).into_response(),
        Err(e) => error_response(e),
    }
}
