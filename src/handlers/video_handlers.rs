//! HTTP handlers for video library entries.

use crate::{
    errors::{AppError, UploadError},
    models::video::{VideoLibraryEntry, WorkflowStatus},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct UpdateStatusReq {
    pub status: WorkflowStatus,
}

/// `GET /videos/{id}`
pub async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VideoLibraryEntry>, AppError> {
    let video = state
        .manager
        .registrar()
        .get_video(id)
        .await
        .map_err(UploadError::from)?;
    Ok(Json(video))
}

/// `PATCH /videos/{id}/status`
pub async fn update_video_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStatusReq>,
) -> Result<Json<VideoLibraryEntry>, AppError> {
    let video = state
        .manager
        .registrar()
        .update_workflow_status(id, req.status)
        .await
        .map_err(UploadError::from)?;
    Ok(Json(video))
}
