//! Worker log ingress handlers
//!
//! Registration is a plain JSON call; streaming runs over a WebSocket where
//! each inbound text frame is one log entry and each outbound frame is the
//! per-entry response. The connection fans into three tasks: the reader
//! feeds the session's bounded ingest channel (backpressure), the processor
//! forwards entries to the handler, and the writer drains the response
//! channel so a slow client never blocks ingest.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stagehand_core::domain::log::{LogEntry, LogResponse};
use stagehand_core::dto::logs::{RegistrationRequest, RegistrationResponse};

use crate::logs::{LogFabric, Session, Triage};

use super::error::ApiResult;
use super::AppState;

/// POST /v1/logs/register
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegistrationRequest>,
) -> ApiResult<Json<RegistrationResponse>> {
    Ok(Json(state.fabric.register(&req)?))
}

/// GET /v1/logs/stream (WebSocket upgrade)
pub async fn stream_logs(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    info!("log streaming connection established");

    let fabric = Arc::clone(&state.fabric);
    let cancel = state.shutdown.child_token();
    let (mut sink, mut source) = socket.split();

    let (response_tx, mut response_rx) =
        mpsc::channel::<LogResponse>(fabric.config().response_buffer);

    // Writer: drains responses onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            let payload = match serde_json::to_string(&response) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to encode log response: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                debug!("log response send failed, closing writer");
                break;
            }
        }
    });

    let mut bound: Option<Arc<Session>> = None;
    let mut processor: Option<JoinHandle<()>> = None;

    // Reader: one text frame is one log entry.
    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("log stream receive error: {}", e);
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                debug!("client closed log stream");
                break;
            }
            _ => continue,
        };

        let entry = match serde_json::from_str::<LogEntry>(&text) {
            Ok(entry) => entry,
            Err(e) => {
                let response = LogResponse::drop_entry(format!("malformed log entry: {}", e));
                if response_tx.send(response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        match fabric.triage(&mut bound, entry) {
            Triage::Rejected(response) => {
                if response_tx.send(response).await.is_err() {
                    break;
                }
            }
            Triage::Accepted(session, entry) => {
                if processor.is_none() {
                    processor = spawn_processor(&fabric, &session, &response_tx, &cancel);
                }
                // Bounded channel: a full ingest buffer blocks this reader
                // until the processor drains it.
                if session.ingest_sender().send(entry).await.is_err() {
                    let _ = response_tx
                        .send(LogResponse::drop_entry("session closed"))
                        .await;
                    break;
                }
            }
        }
    }

    cancel.cancel();
    if let Some(session) = &bound {
        fabric.deactivate_session(&session.session_id);
    }
    drop(response_tx);
    if let Some(processor) = processor {
        let _ = processor.await;
    }
    let _ = writer.await;

    info!("log streaming connection closed");
}

/// Processor: drains the session's ingest channel toward the handler
fn spawn_processor(
    fabric: &Arc<LogFabric>,
    session: &Arc<Session>,
    response_tx: &mpsc::Sender<LogResponse>,
    cancel: &CancellationToken,
) -> Option<JoinHandle<()>> {
    let mut ingest_rx = session.take_receiver()?;

    let fabric = Arc::clone(fabric);
    let session = Arc::clone(session);
    let response_tx = response_tx.clone();
    let cancel = cancel.clone();

    Some(tokio::spawn(async move {
        loop {
            let entry = tokio::select! {
                _ = cancel.cancelled() => break,
                entry = ingest_rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            let response = fabric.process_entry(&session, entry, &cancel).await;
            if response_tx.send(response).await.is_err() {
                // Outbound side is gone; the whole session comes down.
                fabric.deactivate_session(&session.session_id);
                break;
            }
        }
        session.restore_receiver(ingest_rx);
    }))
}
