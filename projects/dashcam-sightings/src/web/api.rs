use crate::pipeline::orchestrator::{get_processing_state, start_batch, stop_batch, BatchRequest};
use crate::run_context::batch_id_for;
use crate::web::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

#[derive(Deserialize)]
pub struct CreateBatchRequest {
    pub video_root: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: String,
}

pub async fn create_batch(
    State(app): State<Arc<AppState>>,
    Json(payload): Json<CreateBatchRequest>,
) -> Result<Json<CreateBatchResponse>, (StatusCode, String)> {
    let batch_id =
        batch_id_for(&payload.output_dir).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let already_active = get_processing_state(&batch_id)
        .map(|state| state.is_active.load(Ordering::Relaxed))
        .unwrap_or(false);
    if already_active {
        return Err((
            StatusCode::CONFLICT,
            format!("Batch {} is already being processed", batch_id),
        ));
    }

    let request = BatchRequest {
        video_root: payload.video_root,
        output_dir: payload.output_dir,
        config: app.config.clone(),
    };
    match start_batch(request, app.backend.clone(), tokio::runtime::Handle::current()) {
        Ok(state) => Ok(Json(CreateBatchResponse {
            batch_id: state.batch_id.clone(),
        })),
        Err(e) => Err((StatusCode::CONFLICT, e.to_string())),
    }
}

pub async fn get_batch(Path(id): Path<String>) -> Result<Json<serde_json::Value>, StatusCode> {
    get_processing_state(&id)
        .map(|state| Json(state.to_progress_json()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Progress JSON once per second until the batch stops being active
pub async fn batch_events(
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let state = get_processing_state(&id).ok_or(StatusCode::NOT_FOUND)?;

    let stream = async_stream::stream! {
        let mut ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(1)));
        while ticks.next().await.is_some() {
            match Event::default().json_data(state.to_progress_json()) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode progress event: {}", e),
            }
            if !state.is_active.load(Ordering::Relaxed) {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn cancel_batch(Path(id): Path<String>) -> StatusCode {
    if stop_batch(&id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}
