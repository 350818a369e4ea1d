//! HTTP surface of the upload service.
//!
//! ## Structure
//! - **Sessions**
//!   - `POST   /sessions` create, `GET /sessions` list
//!   - `GET    /sessions/{id}`, `DELETE /sessions/{id}` (abort)
//!   - `GET    /sessions/{id}/progress`
//!   - `POST   /sessions/{id}/parts/{part_number}` report a part ETag
//!   - `POST   /sessions/{id}/complete`, `/resume`, `/reconcile`, `/refresh-urls`
//!
//! - **Videos**
//!   - `GET    /videos/{id}`, `PATCH /videos/{id}/status`
//!
//! - **Local object store data plane** (only served with the local provider)
//!   - `PUT    /store/uploads/{upload_id}/parts/{part_number}`
//!   - `GET    /store/objects/{*key}`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        session_handlers::{
            abort_session, complete_session, create_session, get_progress, get_session,
            list_sessions, reconcile_session, refresh_part_urls, report_part, resume_session,
        },
        store_handlers::{get_object, upload_part},
        video_handlers::{get_video, update_video_status},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, patch, post, put},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(abort_session))
        .route("/sessions/{id}/progress", get(get_progress))
        .route("/sessions/{id}/parts/{part_number}", post(report_part))
        .route("/sessions/{id}/complete", post(complete_session))
        .route("/sessions/{id}/resume", post(resume_session))
        .route("/sessions/{id}/reconcile", post(reconcile_session))
        .route("/sessions/{id}/refresh-urls", post(refresh_part_urls))
        .route("/videos/{id}", get(get_video))
        .route("/videos/{id}/status", patch(update_video_status))
        .route(
            "/store/uploads/{upload_id}/parts/{part_number}",
            put(upload_part),
        )
        .route("/store/objects/{*key}", get(get_object))
}
