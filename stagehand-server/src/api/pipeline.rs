//! Pipeline execution handler

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use stagehand_core::domain::pipeline::PipelineRequest;

use crate::pipeline::PipelineExecutor;

use super::error::ApiResult;
use super::AppState;

/// POST /v1/pipelines/execute
///
/// Admits the pipeline and streams its progress events as newline-delimited
/// JSON. The stream always ends with a terminal `completed` or `failed`
/// pipeline-level event. Dropping the connection cancels the pipeline and
/// every in-flight worker wait under it.
pub async fn execute_pipeline(
    State(state): State<AppState>,
    Json(req): Json<PipelineRequest>,
) -> ApiResult<Response> {
    let (progress_rx, cancel) = PipelineExecutor::start(
        state.manager.clone(),
        state.settings.worker.clone(),
        state.pipelines.clone(),
        &state.shutdown,
        req,
    )?;

    // Cancels the pipeline when the response body is dropped, i.e. when the
    // caller disconnects before the terminal event.
    let guard = cancel.drop_guard();

    let stream = ReceiverStream::new(progress_rx).map(move |event| {
        let _guard = &guard;
        serde_json::to_vec(&event).map(|mut bytes| {
            bytes.push(b'\n');
            Bytes::from(bytes)
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}
