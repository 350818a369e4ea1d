//! HTTP handlers for upload sessions. Each one is a thin translation onto a
//! `SessionManager` operation; errors render through `AppError`.

use crate::{
    errors::AppError,
    models::session::{SessionStatus, UploadSession},
    services::session_manager::{
        CompletedUpload, CreateSession, CreatedSession, PartUrl, ReconcileReport, UploadProgress,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReportPartReq {
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPartResp {
    pub ok: bool,
    pub part_number: u32,
    pub recorded: bool,
}

#[derive(Debug, Serialize)]
pub struct AbortResp {
    pub ok: bool,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize)]
pub struct RefreshResp {
    pub parts: Vec<PartUrl>,
}

/// `POST /sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSession>,
) -> Result<impl IntoResponse, AppError> {
    let created: CreatedSession = state.manager.create(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /sessions?status=&limit=&offset=`
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<UploadSession>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;
    let sessions = state
        .manager
        .list_sessions(status, query.limit, query.offset)
        .await?;
    Ok(Json(sessions))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadSession>, AppError> {
    Ok(Json(state.manager.get_session(id).await?))
}

/// `GET /sessions/{id}/progress`
pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UploadProgress>, AppError> {
    Ok(Json(state.manager.get_progress(id).await?))
}

/// `POST /sessions/{id}/parts/{part_number}`
pub async fn report_part(
    State(state): State<AppState>,
    Path((id, part_number)): Path<(Uuid, u32)>,
    Json(req): Json<ReportPartReq>,
) -> Result<Json<ReportPartResp>, AppError> {
    if req.etag.trim().trim_matches('"').is_empty() {
        return Err(AppError::bad_request("etag must not be empty"));
    }
    let report = state
        .manager
        .report_part_complete(id, part_number, &req.etag)
        .await?;
    Ok(Json(ReportPartResp {
        ok: true,
        part_number: report.part_number,
        recorded: report.recorded,
    }))
}

/// `POST /sessions/{id}/complete`
pub async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CompletedUpload>, AppError> {
    Ok(Json(state.manager.complete(id).await?))
}

/// `POST /sessions/{id}/resume`
pub async fn resume_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CompletedUpload>, AppError> {
    Ok(Json(state.manager.resume(id).await?))
}

/// `POST /sessions/{id}/reconcile`
pub async fn reconcile_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReconcileReport>, AppError> {
    Ok(Json(state.manager.reconcile(id).await?))
}

/// `POST /sessions/{id}/refresh-urls`
pub async fn refresh_part_urls(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RefreshResp>, AppError> {
    let parts = state.manager.refresh_part_urls(id).await?;
    Ok(Json(RefreshResp { parts }))
}

/// `DELETE /sessions/{id}`
pub async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AbortResp>, AppError> {
    let outcome = state.manager.abort(id).await?;
    Ok(Json(AbortResp {
        ok: true,
        status: outcome.status,
    }))
}
