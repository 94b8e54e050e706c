//! HTTP command surface: typing control and outbound sends.
//!
//! Validation failures answer 422 with a `{"detail": ...}` body. Per-item send
//! failures are reported inside a 200 response instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::ChatRef;
use crate::sender::{BatchResult, OutboundMessage, Sender};
use crate::typing::TypingRegistry;

const MAX_TYPING_SECS: u64 = 300;

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ApiState {
    pub typing: Arc<TypingRegistry>,
    pub sender: Arc<Sender>,
}

// ── Request / response types ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct TypingStartRequest {
    chat_id: ChatRef,
    duration_seconds: u64,
}

#[derive(Serialize)]
struct TypingStartResponse {
    success: bool,
    chat_id: ChatRef,
    duration_seconds: u64,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TypingCancelRequest {
    chat_id: ChatRef,
}

#[derive(Serialize)]
struct TypingCancelResponse {
    success: bool,
    chat_id: ChatRef,
    cancelled_task: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct SendRequest {
    messages: Vec<OutboundMessage>,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn unprocessable(detail: impl Into<String>) -> ApiError {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorBody {
            detail: detail.into(),
        }),
    )
}

/// Numeric strings address chats by id; anything else is a username.
fn normalize_chat(chat: ChatRef) -> ChatRef {
    match chat {
        ChatRef::Username(name) => match name.trim().parse::<i64>() {
            Ok(id) => ChatRef::Id(id),
            Err(_) => ChatRef::Username(name),
        },
        id => id,
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn typing_start(
    State(state): State<ApiState>,
    Json(body): Json<TypingStartRequest>,
) -> Result<Json<TypingStartResponse>, ApiError> {
    if !(1..=MAX_TYPING_SECS).contains(&body.duration_seconds) {
        return Err(unprocessable(format!(
            "duration_seconds must be between 1 and {}",
            MAX_TYPING_SECS
        )));
    }

    let chat = normalize_chat(body.chat_id);
    state
        .typing
        .start(&chat, Duration::from_secs(body.duration_seconds))
        .await;
    info!("Typing started in {} for {}s", chat, body.duration_seconds);

    Ok(Json(TypingStartResponse {
        success: true,
        chat_id: chat,
        duration_seconds: body.duration_seconds,
        error: None,
    }))
}

async fn typing_cancel(
    State(state): State<ApiState>,
    Json(body): Json<TypingCancelRequest>,
) -> Json<TypingCancelResponse> {
    let chat = normalize_chat(body.chat_id);
    let cancelled_task = state.typing.cancel(&chat).await;

    Json(TypingCancelResponse {
        success: true,
        chat_id: chat,
        cancelled_task,
        error: None,
    })
}

async fn send(
    State(state): State<ApiState>,
    Json(body): Json<SendRequest>,
) -> Result<Json<BatchResult>, ApiError> {
    if body.messages.is_empty() {
        return Err(unprocessable("messages must contain at least one item"));
    }

    let messages: Vec<OutboundMessage> = body
        .messages
        .into_iter()
        .map(|mut m| {
            m.chat_id = normalize_chat(m.chat_id);
            m
        })
        .collect();

    Ok(Json(state.sender.send_batch(&messages).await))
}

// ── Server ─────────────────────────────────────────────────────────────────────

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/typing/start", post(typing_start))
        .route("/typing/cancel", post(typing_cancel))
        .route("/send", post(send))
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Serve until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Command API listening on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("Server error")?;

    info!("Command API stopped");
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
