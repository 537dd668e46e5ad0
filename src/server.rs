use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::parse_bool_flag;
use crate::database::{ChatDatabase, DiscussionAccess, User};
use crate::discussion::{Discussion, DiscussionSummary, ExportFormat};
use crate::error::ApiError;
use crate::jobs::{DataZoneJob, PruneJob};
use crate::orchestrator::TurnRequest;
use crate::runtime::BackendRuntime;
use crate::tasks::TaskRecord;

pub type ServerState = BackendRuntime;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pid: u32,
}

#[derive(Debug, Deserialize)]
struct CreateDiscussionRequest {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwitchBranchRequest {
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CreateArtefactRequest {
    title: String,
    content: String,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateArtefactRequest {
    content: String,
    images: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct TaskSubmitted {
    task_id: String,
}

pub async fn serve(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}'", runtime.config.bind_addr))?;
    let app = router(Arc::new(runtime));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Colloquy listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/discussions", get(list_discussions).post(create_discussion))
        .route("/discussions/prune", post(prune_discussions))
        .route("/discussions/:id", get(get_discussion).delete(delete_discussion))
        .route("/discussions/:id/chat", post(chat))
        .route("/discussions/:id/stop_generation", post(stop_generation))
        .route("/discussions/:id/branch/:message_id", get(get_branch))
        .route("/discussions/:id/active_branch", put(switch_branch))
        .route(
            "/discussions/:id/messages/:message_id",
            axum::routing::delete(delete_message),
        )
        .route("/discussions/:id/export", get(export_discussion))
        .route(
            "/discussions/:id/artefacts",
            get(list_artefacts).post(create_artefact),
        )
        .route(
            "/discussions/:id/artefacts/:title",
            get(get_artefact).put(update_artefact).delete(delete_artefact),
        )
        .route("/discussions/:id/artefacts/:title/load", post(load_artefact))
        .route("/discussions/:id/artefacts/:title/unload", post(unload_artefact))
        .route("/discussions/:id/data_zone/process", post(process_data_zone))
        .route("/discussions/:id/star", post(star).delete(unstar))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api", protected)
        .route("/ws", get(ws_route))
        .route("/health", get(health))
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = authorize(request.headers(), &state.db)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn authorize(headers: &HeaderMap, db: &ChatDatabase) -> Result<User, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    user_for_token(token, db)
}

fn user_for_token(token: &str, db: &ChatDatabase) -> Result<User, ApiError> {
    db.get_user_by_token(token)?.ok_or(ApiError::Unauthorized)
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pid: state.connections.pid(),
    })
}

// ---- discussions ----

/// Loads a discussion the caller may see; `interact` additionally requires write access.
fn discussion_for(
    db: &ChatDatabase,
    user: &User,
    discussion_id: &str,
    interact: bool,
) -> Result<(Discussion, DiscussionAccess), ApiError> {
    let discussion = db
        .load_discussion(discussion_id)?
        .ok_or_else(|| not_found("discussion", discussion_id))?;
    let access = db
        .discussion_access(user.id, discussion_id)?
        .ok_or_else(|| ApiError::Forbidden("no access to this discussion".to_string()))?;
    if interact && !access.can_interact() {
        return Err(ApiError::Forbidden(
            "this discussion is shared with you read-only".to_string(),
        ));
    }
    Ok((discussion, access))
}

fn not_found(kind: &str, id: &str) -> ApiError {
    ApiError::NotFound(format!("{} '{}' not found", kind, id))
}

async fn list_discussions(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<DiscussionSummary>>, ApiError> {
    Ok(Json(state.db.list_discussions_for_user(user.id)?))
}

async fn create_discussion(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Json(body): Json<CreateDiscussionRequest>,
) -> Result<(StatusCode, Json<DiscussionSummary>), ApiError> {
    state.paths.ensure_user_tree(&user.username)?;
    let title = body.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let mut discussion = Discussion::new(user.id, title);
    discussion.commit(&state.db)?;
    tracing::info!("User {} created discussion {}", user.username, discussion.id);
    Ok((StatusCode::CREATED, Json(discussion.summary())))
}

async fn get_discussion(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (discussion, access) = discussion_for(&state.db, &user, &id, false)?;
    let starred = state.db.is_starred(user.id, &id)?;
    Ok(Json(json!({
        "discussion": discussion.summary(),
        "metadata": discussion.metadata,
        "access": access,
        "starred": starred,
        "active_branch_id": discussion.active_branch_id(),
        "messages": discussion.active_branch(),
        "data_zone": discussion.data_zone,
        "loaded_artefacts": discussion.loaded_artefacts,
    })))
}

async fn delete_discussion(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let (_, access) = discussion_for(&state.db, &user, &id, false)?;
    if access != DiscussionAccess::Owner {
        return Err(ApiError::Forbidden(
            "only the owner can delete a discussion".to_string(),
        ));
    }
    state.db.delete_discussion(&id)?;
    Ok(Json(MessageResponse {
        message: "Discussion deleted".to_string(),
    }))
}

async fn get_branch(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, message_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (discussion, _) = discussion_for(&state.db, &user, &id, false)?;
    if discussion.message(&message_id).is_none() {
        return Err(not_found("message", &message_id));
    }
    Ok(Json(json!({ "messages": discussion.get_branch(&message_id) })))
}

async fn switch_branch(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(body): Json<SwitchBranchRequest>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    discussion
        .switch_to_branch(&body.message_id)
        .map_err(|_| not_found("message", &body.message_id))?;
    discussion.commit(&state.db)?;
    Ok(Json(json!({
        "active_branch_id": discussion.active_branch_id(),
        "messages": discussion.active_branch(),
    })))
}

async fn delete_message(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, message_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    let removed = discussion
        .delete_branch(&message_id)
        .map_err(|_| not_found("message", &message_id))?;
    discussion.commit(&state.db)?;
    Ok(Json(json!({
        "deleted": removed,
        "active_branch_id": discussion.active_branch_id(),
    })))
}

async fn export_discussion(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let raw = query.format.unwrap_or_else(|| "json".to_string());
    let format = ExportFormat::parse(&raw)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown export format '{}'", raw)))?;
    let (discussion, _) = discussion_for(&state.db, &user, &id, false)?;
    let content = discussion.export(format)?;
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Markdown => "text/markdown; charset=utf-8",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], content).into_response())
}

async fn star(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    discussion_for(&state.db, &user, &id, false)?;
    state.db.star_discussion(user.id, &id)?;
    Ok(Json(json!({ "starred": true })))
}

async fn unstar(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    discussion_for(&state.db, &user, &id, false)?;
    state.db.unstar_discussion(user.id, &id)?;
    Ok(Json(json!({ "starred": false })))
}

// ---- artefacts ----

async fn list_artefacts(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let (discussion, _) = discussion_for(&state.db, &user, &id, false)?;
    Ok(Json(json!({ "artefacts": discussion.list_artefacts() })))
}

async fn create_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(body): Json<CreateArtefactRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    let artefact = discussion
        .add_artefact(&body.title, &body.content, body.images, &user.username)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
        .clone();
    discussion.commit(&state.db)?;
    Ok((StatusCode::CREATED, Json(json!(artefact))))
}

async fn get_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, title)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<Value>, ApiError> {
    let (discussion, _) = discussion_for(&state.db, &user, &id, false)?;
    let artefact = discussion
        .get_artefact(&title, query.version)
        .ok_or_else(|| not_found("artefact", &title))?;
    let versions: Vec<u32> = discussion
        .artefact_versions(&title)
        .iter()
        .map(|a| a.version)
        .collect();
    Ok(Json(json!({ "artefact": artefact, "versions": versions })))
}

async fn update_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, title)): Path<(String, String)>,
    Json(body): Json<UpdateArtefactRequest>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    let artefact = discussion
        .update_artefact(&title, &body.content, body.images, &user.username)
        .map_err(|_| not_found("artefact", &title))?
        .clone();
    discussion.commit(&state.db)?;
    Ok(Json(json!(artefact)))
}

async fn delete_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, title)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    let removed = discussion.remove_artefact(&title);
    if removed == 0 {
        return Err(not_found("artefact", &title));
    }
    discussion.commit(&state.db)?;
    Ok(Json(json!({ "deleted_versions": removed })))
}

async fn load_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, title)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    discussion
        .load_artefact_into_data_zone(&title, query.version)
        .map_err(|_| not_found("artefact", &title))?;
    discussion.commit(&state.db)?;
    Ok(Json(json!({
        "data_zone": discussion.data_zone,
        "loaded_artefacts": discussion.loaded_artefacts,
    })))
}

async fn unload_artefact(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path((id, title)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (mut discussion, _) = discussion_for(&state.db, &user, &id, true)?;
    discussion
        .unload_artefact_from_data_zone(&title)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    discussion.commit(&state.db)?;
    Ok(Json(json!({
        "data_zone": discussion.data_zone,
        "loaded_artefacts": discussion.loaded_artefacts,
    })))
}

// ---- chat ----

/// Turns the multipart `chat` fields into a turn request.
fn turn_request(discussion_id: String, fields: &HashMap<String, String>) -> Result<TurnRequest, ApiError> {
    let image_refs = match fields
        .get("image_server_paths_json")
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
    {
        Some(raw) => serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
            ApiError::BadRequest(format!("image_server_paths_json is not a JSON string list: {}", e))
        })?,
        None => Vec::new(),
    };
    let flag = |name: &str| fields.get(name).is_some_and(|v| parse_bool_flag(v));
    Ok(TurnRequest {
        discussion_id,
        prompt: fields.get("prompt").cloned().unwrap_or_default(),
        image_refs,
        parent_message_id: fields
            .get("parent_message_id")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty() && *v != "null")
            .map(str::to_string),
        is_resend: flag("is_resend"),
        web_search_enabled: flag("web_search_enabled"),
    })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed form data: {}", e)))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(format!("unreadable field '{}': {}", name, e)))?;
        fields.insert(name, value);
    }
    let request = turn_request(id, &fields)?;

    let orchestrator = state.orchestrator.clone();
    let rx = tokio::task::spawn_blocking(move || orchestrator.start_turn(user, request))
        .await
        .map_err(|e| ApiError::Internal(format!("turn setup panicked: {}", e)))??;

    let body = Body::from_stream(
        rx.into_stream()
            .map(|frame| Ok::<_, Infallible>(frame.to_ndjson_line())),
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response())
}

async fn stop_generation(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    discussion_for(&state.db, &user, &id, true)?;
    let message = if state.orchestrator.stop_generation(user.id, &id) {
        "Generation stopped"
    } else {
        "No generation in progress"
    };
    Ok(Json(MessageResponse {
        message: message.to_string(),
    }))
}

// ---- tasks ----

async fn process_data_zone(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<TaskSubmitted>, ApiError> {
    discussion_for(&state.db, &user, &id, true)?;
    let job = DataZoneJob {
        db: state.db.clone(),
        models: state.models.clone(),
        connections: state.connections.clone(),
        user: user.clone(),
        discussion_id: id,
    };
    let task_id = state.tasks.submit("data_zone", user.id, Box::new(job))?;
    Ok(Json(TaskSubmitted { task_id }))
}

async fn prune_discussions(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
) -> Result<Json<TaskSubmitted>, ApiError> {
    let job = PruneJob {
        db: state.db.clone(),
        user_id: user.id,
    };
    let task_id = state.tasks.submit("prune", user.id, Box::new(job))?;
    Ok(Json(TaskSubmitted { task_id }))
}

fn owned_task(state: &ServerState, user: &User, task_id: &str) -> Result<TaskRecord, ApiError> {
    state
        .tasks
        .get(task_id)
        .filter(|record| record.owner_user_id == user.id || user.is_admin)
        .ok_or_else(|| not_found("task", task_id))
}

async fn list_tasks(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
) -> Json<Vec<TaskRecord>> {
    Json(state.tasks.list_for_user(user.id))
}

async fn get_task(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(owned_task(&state, &user, &task_id)?))
}

async fn cancel_task(
    State(state): State<Arc<ServerState>>,
    Extension(user): Extension<User>,
    Path(task_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    owned_task(&state, &user, &task_id)?;
    let message = if state.tasks.cancel(&task_id) {
        "Cancellation requested"
    } else {
        "Task already finished"
    };
    Ok(Json(MessageResponse {
        message: message.to_string(),
    }))
}

// ---- websocket ----

async fn ws_route(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user = match query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => user_for_token(token, &state.db)?,
        None => authorize(&headers, &state.db)?,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(state, user, socket)))
}

async fn handle_socket(state: Arc<ServerState>, user: User, mut socket: WebSocket) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let rx = state.connections.connect(&user, &session_id);
    tracing::debug!("Websocket session {} opened for {}", session_id, user.username);

    loop {
        tokio::select! {
            payload = rx.recv_async() => {
                let Ok(payload) = payload else { break };
                if socket.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.connections.disconnect(&user, &session_id);
    tracing::debug!("Websocket session {} closed for {}", session_id, user.username);
}
