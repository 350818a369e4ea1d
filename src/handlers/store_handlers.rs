//! Data plane of the local storage provider.
//!
//! Clients `PUT` part bytes to the presigned URLs issued at session creation;
//! bodies are streamed to disk without buffering. These routes belong to the
//! object store, not the session manager: recording a part still requires the
//! client to report the returned ETag.

use crate::{errors::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Query string of a presigned part URL.
#[derive(Debug, Deserialize)]
pub struct PartUploadQuery {
    pub expires: i64,
    pub signature: String,
}

/// PUT `/store/uploads/{upload_id}/parts/{part_number}?expires=&signature=`
pub async fn upload_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(query): Query<PartUploadQuery>,
    body: Body,
) -> Result<Response, AppError> {
    let store = state
        .local_store
        .as_ref()
        .ok_or_else(|| AppError::not_found("local storage provider is not enabled"))?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let etag = store
        .write_part(
            &upload_id,
            part_number,
            query.expires,
            &query.signature,
            stream,
        )
        .await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    Ok(response)
}

/// GET `/store/objects/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let store = state
        .local_store
        .as_ref()
        .ok_or_else(|| AppError::not_found("local storage provider is not enabled"))?;

    let (meta, file) = store.open_object(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Some(size) = meta.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }
    Ok(response)
}
