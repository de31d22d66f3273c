//! Upload, progress and download endpoints for conversion jobs.

use std::convert::Infallible;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde_json::json;

use super::super::AppState;

/// Multipart field carrying the workbook.
const UPLOAD_FIELD: &str = "excel";

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const DOWNLOAD_DISPOSITION: &str = "attachment; filename=\"output_with_images.xlsx\"";

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "message": message.into() })),
    )
        .into_response()
}

/// Accept a workbook upload and start processing it.
pub async fn upload_workbook(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some(UPLOAD_FIELD) {
                    continue;
                }
                match field.bytes().await {
                    Ok(bytes) => {
                        upload = Some(bytes);
                        break;
                    }
                    Err(e) => return failure(e.status(), e.body_text()),
                }
            }
            Ok(None) => break,
            Err(e) => return failure(e.status(), e.body_text()),
        }
    }

    let Some(upload) = upload else {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("missing multipart field '{}'", UPLOAD_FIELD),
        );
    };

    match state.jobs.submit(&upload).await {
        Ok(job_id) => Json(json!({
            "success": true,
            "progressId": job_id,
            "message": "file uploaded, processing started",
        }))
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to store upload: {}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload")
        }
    }
}

/// Stream a job's progress as server-sent events.
pub async fn job_progress(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let events = state.jobs.bus().subscribe(&job_id).map(|event| {
        Ok::<_, Infallible>(
            Event::default()
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().data(event.message)),
        )
    });

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Hand out a finished workbook once, then tear the job down.
pub async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    match state.jobs.take_output(&job_id).await {
        Some(bytes) => (
            [
                (header::CONTENT_TYPE, XLSX_MIME),
                (header::CONTENT_DISPOSITION, DOWNLOAD_DISPOSITION),
            ],
            bytes,
        )
            .into_response(),
        None => failure(StatusCode::NOT_FOUND, "file does not exist or has expired"),
    }
}
