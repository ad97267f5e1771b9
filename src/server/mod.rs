//! Observability/control HTTP+WS surface (§2.1/§6.1): a thin front-end over
//! the EventBus and FlagController for supervising processes that prefer
//! HTTP to touching files directly. Not a GUI — just `/status`, `/ws/events`,
//! and `/flags/{kind}`.

use crate::flags::{FlagController, FlagKind};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::events::EventBus;

#[derive(Clone)]
pub struct AppState {
    pub events: EventBus,
    pub flags: Arc<FlagController>,
    pub run_id: Arc<AtomicI64>,
    pub status: Arc<std::sync::Mutex<String>>,
}

impl AppState {
    pub fn new(events: EventBus, flags: Arc<FlagController>) -> Self {
        Self {
            events,
            flags,
            run_id: Arc::new(AtomicI64::new(0)),
            status: Arc::new(std::sync::Mutex::new("RUNNING".to_string())),
        }
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { ok: true, data: Some(data), error: None })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ws/events", get(ws_events))
        .route("/flags/{kind}", axum::routing::post(create_flag).delete(remove_flag))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status(State(s): State<AppState>) -> impl IntoResponse {
    let run_id = s.run_id.load(Ordering::Relaxed);
    let status = s.status.lock().map(|g| g.clone()).unwrap_or_else(|_| "UNKNOWN".into());
    Envelope::ok(serde_json::json!({ "run_id": run_id, "status": status }))
}

async fn create_flag(State(s): State<AppState>, Path(kind): Path<String>) -> impl IntoResponse {
    match FlagKind::from_str(&kind) {
        Some(k) => {
            s.flags.create(k);
            (StatusCode::OK, Envelope::ok("created")).into_response()
        }
        None => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"ok": false, "error": "unknown flag kind"}))).into_response(),
    }
}

async fn remove_flag(State(s): State<AppState>, Path(kind): Path<String>) -> impl IntoResponse {
    match FlagKind::from_str(&kind) {
        Some(k) => {
            s.flags.remove(k);
            (StatusCode::OK, Envelope::ok("removed")).into_response()
        }
        None => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"ok": false, "error": "unknown flag kind"}))).into_response(),
    }
}

async fn ws_events(ws: WebSocketUpgrade, State(s): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_events(socket, s))
}

async fn stream_events(mut socket: WebSocket, state: AppState) {
    info!("observer connected to /ws/events");
    let mut rx = state.events.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        let text = serde_json::to_string(&ev).unwrap_or_default();
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
    info!("observer disconnected from /ws/events");
}
