//! HTTP server: file listing, uploads, and streaming chat.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/files` | List objects in the store for display |
//! | `POST` | `/upload` | Multipart upload: write to the store, then upsert the index |
//! | `GET`  | `/chat` | SSE chat stream (`message`, `use_reasoning`, `session` params) |
//! | `POST` | `/new_session` | Start a fresh chat session |
//!
//! Each upload runs one single-object upsert against the index; a tokio
//! `Mutex` serializes them so two passes never overlap on one index. A
//! failed upsert after a successful store write is reported as an upload
//! failure: the object exists in storage, but the index must not silently
//! diverge.
//!
//! # SSE Contract
//!
//! The chat stream emits `sources` (unique citation URLs, once), unnamed
//! `data` events carrying `{"chunk": ...}` answer fragments, `error`, and a
//! final `end` event with the model that answered.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::chat::{answer_question, ChatMessage, Role};
use crate::config::Config;
use crate::error::SyncError;
use crate::index::ChunkIndex;
use crate::object_store::ObjectStore;
use crate::reconcile::upsert_object;

type SessionMap = HashMap<String, Vec<ChatMessage>>;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn ChunkIndex>,
    sessions: Arc<std::sync::Mutex<SessionMap>>,
    /// Serializes index mutation: one upsert or sync pass at a time.
    sync_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(
    config: Config,
    store: Arc<dyn ObjectStore>,
    index: Arc<dyn ChunkIndex>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let max_upload = config.server.max_upload_bytes;

    let state = AppState {
        config: Arc::new(config),
        store,
        index,
        sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
        sync_lock: Arc::new(tokio::sync::Mutex::new(())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/files", get(handle_list_files))
        .route("/upload", post(handle_upload))
        .route("/chat", get(handle_chat))
        .route("/new_session", post(handle_new_session))
        .layer(DefaultBodyLimit::max(max_upload + 64 * 1024))
        .layer(cors)
        .with_state(state);

    println!("Server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /files ============

async fn handle_list_files(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let files = state
        .store
        .list_for_display()
        .await
        .map_err(|e| internal(format!("failed to list files: {}", e)))?;
    Ok(Json(serde_json::json!({ "files": files })))
}

// ============ POST /upload ============

/// Keep only filename characters that are safe as an object key segment.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_allowed(config: &Config, filename: &str) -> bool {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    filename.contains('.')
        && config
            .server
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart request: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field
                .file_name()
                .map(sanitize_filename)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| bad_request("No selected file"))?;
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
            upload = Some((filename, bytes.to_vec()));
        }
    }

    let (filename, bytes) =
        upload.ok_or_else(|| bad_request("No file part in the request"))?;

    if !extension_allowed(&state.config, &filename) {
        return Err(bad_request(format!(
            "File type not allowed. Allowed: {}",
            state.config.server.allowed_extensions.join(", ")
        )));
    }
    if bytes.len() > state.config.server.max_upload_bytes {
        return Err(bad_request(format!(
            "File exceeds the {} byte upload limit",
            state.config.server.max_upload_bytes
        )));
    }

    let prefix = state.config.store.prefix.trim_end_matches('/');
    let key = if prefix.is_empty() {
        filename.clone()
    } else {
        format!("{}/{}", prefix, filename)
    };

    println!("Upload: {} -> {}", filename, key);
    let remote = state
        .store
        .put(&key, bytes)
        .await
        .map_err(|e| internal(format!("Failed to upload file to storage: {}", e)))?;

    // The object now exists in storage. A processing failure from here on
    // is still surfaced as a failed upload so the index never diverges
    // silently.
    let _guard = state.sync_lock.lock().await;
    let chunks_added = upsert_object(
        state.store.as_ref(),
        state.index.as_ref(),
        state.config.chunking.clone(),
        &key,
        &remote.version_id,
        remote.last_modified,
    )
    .await
    .map_err(|e| match e {
        SyncError::ProcessingFailed { .. } => internal(format!(
            "File uploaded to storage, but processing produced no indexable text: {}",
            e
        )),
        other => internal(format!(
            "File uploaded to storage, but indexing failed: {}",
            other
        )),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message": format!("File '{}' uploaded and processed successfully.", filename),
            "filename": filename,
            "key": key,
            "url": state.store.public_url(&key),
            "chunks_added": chunks_added,
        })),
    ))
}

// ============ GET /chat (SSE) ============

#[derive(Deserialize)]
struct ChatParams {
    #[serde(default)]
    message: String,
    #[serde(default)]
    use_reasoning: bool,
    #[serde(default)]
    session: Option<String>,
}

/// Filename portion of a source URL, for display next to the link.
fn url_filename(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Source Document")
        .to_string()
}

fn sse_json(event: Option<&str>, payload: serde_json::Value) -> Event {
    let base = Event::default().data(payload.to_string());
    match event {
        Some(name) => base.event(name),
        None => base,
    }
}

async fn handle_chat(
    State(state): State<AppState>,
    Query(params): Query<ChatParams>,
) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    let message = params.message.trim().to_string();
    let session_id = params
        .session
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    tokio::spawn(async move {
        if message.is_empty() {
            let _ = tx
                .send(Ok(sse_json(
                    Some("error"),
                    serde_json::json!({ "error": "No message provided" }),
                )))
                .await;
            let _ = tx
                .send(Ok(sse_json(Some("end"), serde_json::json!({}))))
                .await;
            return;
        }

        let history = state
            .sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .cloned()
            .unwrap_or_default();

        let answer = match answer_question(
            &state.config.chat,
            state.index.as_ref(),
            &history,
            &message,
            params.use_reasoning,
        )
        .await
        {
            Ok(answer) => answer,
            Err(e) => {
                eprintln!("Chat pipeline failed for session {}: {}", session_id, e);
                let _ = tx
                    .send(Ok(sse_json(
                        Some("error"),
                        serde_json::json!({ "error": "An error occurred during response generation." }),
                    )))
                    .await;
                let _ = tx
                    .send(Ok(sse_json(Some("end"), serde_json::json!({}))))
                    .await;
                return;
            }
        };

        if !answer.sources.is_empty() {
            let sources: Vec<serde_json::Value> = answer
                .sources
                .iter()
                .map(|url| serde_json::json!({ "url": url, "filename": url_filename(url) }))
                .collect();
            let _ = tx
                .send(Ok(sse_json(Some("sources"), serde_json::json!(sources))))
                .await;
        }

        let mut accumulated = String::new();
        let mut errored = false;
        let mut tokens = answer.tokens;
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => {
                    accumulated.push_str(&token);
                    if tx
                        .send(Ok(sse_json(None, serde_json::json!({ "chunk": token }))))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    eprintln!("Chat stream failed for session {}: {}", session_id, e);
                    errored = true;
                    let _ = tx
                        .send(Ok(sse_json(
                            Some("error"),
                            serde_json::json!({ "error": "An error occurred during response generation." }),
                        )))
                        .await;
                    break;
                }
            }
        }

        // History records only completed exchanges.
        if !errored && !accumulated.is_empty() {
            let limit = state.config.chat.history_limit;
            let mut sessions = state.sessions.lock().unwrap();
            let entry = sessions.entry(session_id.clone()).or_default();
            entry.push(ChatMessage {
                role: Role::Human,
                content: message,
            });
            entry.push(ChatMessage {
                role: Role::Assistant,
                content: accumulated,
            });
            if entry.len() > limit {
                let excess = entry.len() - limit;
                entry.drain(..excess);
            }
        }

        let _ = tx
            .send(Ok(sse_json(
                Some("end"),
                serde_json::json!({ "model_used": answer.model, "session_id": session_id }),
            )))
            .await;
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

// ============ POST /new_session ============

async fn handle_new_session(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session_id = Uuid::new_v4().to_string();
    state
        .sessions
        .lock()
        .unwrap()
        .insert(session_id.clone(), Vec::new());
    Json(serde_json::json!({
        "message": "New session started.",
        "session_id": session_id,
    }))
}
