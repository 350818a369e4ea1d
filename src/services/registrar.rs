//! Video Library Registrar.
//!
//! Writes the permanent catalog row for a promoted video and wires it to its
//! lesson. Registration is keyed on the video id, so retrying it after a
//! failure never produces a second row for the same library object.

use crate::models::video::{VideoLibraryEntry, WorkflowStatus};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("video `{0}` not found")]
    NotFound(Uuid),
    #[error("video `{video_id}` is already registered at `{library_key}`")]
    KeyMismatch { video_id: Uuid, library_key: String },
    #[error("cannot move a video from `{from}` to `{to}`")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Everything needed to register a promoted video.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub video_id: Uuid,
    pub library_key: String,
    pub course_id: Option<Uuid>,
    pub module_id: Option<Uuid>,
    pub lesson_id: Option<Uuid>,
    pub title: String,
    pub original_filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub duration_seconds: Option<f64>,
}

const VIDEO_COLUMNS: &str = "id, library_key, course_id, module_id, lesson_id, title, \
     original_filename, content_type, size_bytes, duration_seconds, workflow_status, \
     created_at, updated_at, approved_at, published_at";

/// Attempts at a workflow move while other editors keep changing the status.
const TRANSITION_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct VideoRegistrar {
    db: Arc<SqlitePool>,
}

impl VideoRegistrar {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert the catalog row as `draft` and, when a lesson is given, point
    /// the lesson at the video in the same transaction.
    pub async fn register_video(
        &self,
        video: &NewVideo,
    ) -> Result<VideoLibraryEntry, RegistrarError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO video_library (
                id, library_key, course_id, module_id, lesson_id, title, original_filename,
                content_type, size_bytes, duration_seconds, workflow_status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(video.video_id)
        .bind(&video.library_key)
        .bind(video.course_id)
        .bind(video.module_id)
        .bind(video.lesson_id)
        .bind(&video.title)
        .bind(&video.original_filename)
        .bind(&video.content_type)
        .bind(video.size_bytes as i64)
        .bind(video.duration_seconds)
        .bind(WorkflowStatus::Draft)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let entry = sqlx::query_as::<_, VideoLibraryEntry>(&format!(
            "SELECT {} FROM video_library WHERE id = ?",
            VIDEO_COLUMNS
        ))
        .bind(video.video_id)
        .fetch_one(&mut *tx)
        .await?;
        if entry.library_key != video.library_key {
            return Err(RegistrarError::KeyMismatch {
                video_id: video.video_id,
                library_key: entry.library_key,
            });
        }

        if let Some(lesson_id) = video.lesson_id {
            let updated = sqlx::query(
                "UPDATE lessons SET video_id = ?, video_key = ?, video_status = 'ready', \
                 updated_at = ? WHERE id = ?",
            )
            .bind(video.video_id)
            .bind(&video.library_key)
            .bind(now)
            .bind(lesson_id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                warn!(
                    video_id = %video.video_id,
                    %lesson_id,
                    "lesson not found; video left unassigned"
                );
            }
        }

        tx.commit().await?;
        if inserted {
            info!(video_id = %video.video_id, library_key = %video.library_key, "registered video");
        }
        Ok(entry)
    }

    pub async fn get_video(&self, id: Uuid) -> Result<VideoLibraryEntry, RegistrarError> {
        sqlx::query_as::<_, VideoLibraryEntry>(&format!(
            "SELECT {} FROM video_library WHERE id = ?",
            VIDEO_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(RegistrarError::NotFound(id))
    }

    /// Move a video one step through its editorial workflow, checked against
    /// [`WorkflowStatus::allowed_transitions`]. Approval and publication stamp
    /// their timestamps; returning to draft clears both.
    ///
    /// The update only applies if the status is still the one the check saw,
    /// so two editors racing from the same status cannot both win.
    pub async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
    ) -> Result<VideoLibraryEntry, RegistrarError> {
        let mut current = self.get_video(id).await?;
        for _ in 0..TRANSITION_ATTEMPTS {
            if !current.workflow_status.can_transition_to(status) {
                break;
            }

            let now = Utc::now();
            let (approved_at, published_at) = match status {
                WorkflowStatus::Draft => (None, None),
                WorkflowStatus::Review => (current.approved_at, current.published_at),
                WorkflowStatus::Approved => (Some(now), current.published_at),
                WorkflowStatus::Published => (current.approved_at, Some(now)),
            };
            let updated = sqlx::query_as::<_, VideoLibraryEntry>(&format!(
                "UPDATE video_library SET workflow_status = ?, approved_at = ?, \
                 published_at = ?, updated_at = ? \
                 WHERE id = ? AND workflow_status = ? RETURNING {}",
                VIDEO_COLUMNS
            ))
            .bind(status)
            .bind(approved_at)
            .bind(published_at)
            .bind(now)
            .bind(id)
            .bind(current.workflow_status)
            .fetch_optional(&*self.db)
            .await?;
            if let Some(entry) = updated {
                info!(
                    video_id = %id,
                    from = %current.workflow_status,
                    to = %status,
                    "updated workflow status"
                );
                return Ok(entry);
            }
            current = self.get_video(id).await?;
        }
        Err(RegistrarError::InvalidTransition {
            from: current.workflow_status,
            to: status,
        })
    }
}
