//! SQLite persistence for upload sessions.
//!
//! Every state change is one conditional `UPDATE` whose `WHERE` clause restates
//! its precondition, so concurrent requests on the same session are ordered by
//! SQLite rather than by locks in this process. Mutating methods report
//! whether the update applied; callers re-read the session to learn why not.

use crate::models::session::{
    CompletionStage, PartRow, RowDecodeError, SessionRow, SessionStatus, UploadSession,
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Corrupt(#[from] RowDecodeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`SessionStore::record_part_etag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartRecord {
    /// The ETag was written by this call.
    Recorded,
    /// The same ETag was already recorded.
    Unchanged,
    /// A different ETag is already recorded.
    Conflict { recorded: String },
    NotUploading(SessionStatus),
    UnknownSession,
    UnknownPart,
}

const SESSION_COLUMNS: &str = "id, upload_id, staging_key, library_key, filename, content_type, \
     file_size, part_size, part_count, course_id, module_id, lesson_id, title, status, \
     completion_stage, lease_expires_at, video_id, last_error, retry_count, created_at, \
     updated_at, expires_at, completed_at";

/// States a session may be aborted or expired from. A `completing` session
/// qualifies only while no request holds its lease and nothing has been
/// registered for it yet. Binds one parameter: the current time.
const TERMINABLE: &str = "(status IN ('initiated', 'uploading') \
     OR (status = 'completing' AND completion_stage != 'registered' \
         AND (lease_expires_at IS NULL OR lease_expires_at <= ?)))";

/// Sessions the sweeper may expire. Unlike abort, expiry never discards an
/// object that has already been promoted; those sessions are resumed
/// instead. Binds one parameter: the current time.
const EXPIRABLE: &str = "(status IN ('initiated', 'uploading') \
     OR (status = 'completing' AND completion_stage IN ('pending', 'finalized') \
         AND (lease_expires_at IS NULL OR lease_expires_at <= ?)))";

/// Attempts at explaining a rejected part report before giving up on a
/// session whose state keeps moving underneath us.
const REPORT_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a session and all of its part rows in one transaction.
    pub async fn insert(&self, session: &UploadSession) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, upload_id, staging_key, library_key, filename, content_type,
                file_size, part_size, part_count, course_id, module_id, lesson_id, title,
                status, completion_stage, lease_expires_at, video_id, last_error, retry_count,
                created_at, updated_at, expires_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id)
        .bind(&session.upload_id)
        .bind(&session.staging_key)
        .bind(&session.library_key)
        .bind(&session.filename)
        .bind(&session.content_type)
        .bind(session.file_size as i64)
        .bind(session.part_size as i64)
        .bind(i64::from(session.part_count))
        .bind(session.course_id)
        .bind(session.module_id)
        .bind(session.lesson_id)
        .bind(&session.title)
        .bind(session.status)
        .bind(session.completion_stage)
        .bind(session.lease_expires_at)
        .bind(session.video_id)
        .bind(&session.last_error)
        .bind(i64::from(session.retry_count))
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .bind(session.completed_at)
        .execute(&mut *tx)
        .await?;

        for part in &session.parts {
            sqlx::query(
                "INSERT INTO upload_session_parts (session_id, part_number, upload_url, etag) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(session.id)
            .bind(i64::from(part.part_number))
            .bind(&part.upload_url)
            .bind(&part.etag)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load a session with its parts from one consistent snapshot.
    pub async fn fetch(&self, id: Uuid) -> StoreResult<Option<UploadSession>> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let parts = sqlx::query_as::<_, PartRow>(
            "SELECT part_number, upload_url, etag FROM upload_session_parts \
             WHERE session_id = ? ORDER BY part_number",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(row.into_session(parts)?))
    }

    /// Newest sessions first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<SessionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<UploadSession>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM upload_sessions", SESSION_COLUMNS));
        if let Some(status) = status {
            builder.push(" WHERE status = ");
            builder.push_bind(status);
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<SessionRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let parts = sqlx::query_as::<_, PartRow>(
                "SELECT part_number, upload_url, etag FROM upload_session_parts \
                 WHERE session_id = ? ORDER BY part_number",
            )
            .bind(row.id)
            .fetch_all(&*self.db)
            .await?;
            sessions.push(row.into_session(parts)?);
        }
        Ok(sessions)
    }

    /// Ids of non-terminal sessions whose `expires_at` has passed, oldest first.
    pub async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM upload_sessions \
             WHERE status IN ('initiated', 'uploading', 'completing') AND expires_at <= ? \
             ORDER BY expires_at LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(ids)
    }

    /// `initiated → uploading`.
    pub async fn mark_uploading(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'uploading', updated_at = ? \
             WHERE id = ? AND status = 'initiated'",
        )
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record `etag` for one part if it has none yet and the session is
    /// still `uploading`.
    pub async fn record_part_etag(
        &self,
        id: Uuid,
        part_number: u32,
        etag: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PartRecord> {
        for _ in 0..REPORT_ATTEMPTS {
            let result = sqlx::query(
                "UPDATE upload_session_parts SET etag = ?, reported_at = ? \
                 WHERE session_id = ? AND part_number = ? AND etag IS NULL \
                 AND EXISTS (SELECT 1 FROM upload_sessions WHERE id = ? AND status = 'uploading')",
            )
            .bind(etag)
            .bind(now)
            .bind(id)
            .bind(i64::from(part_number))
            .bind(id)
            .execute(&*self.db)
            .await?;
            if result.rows_affected() == 1 {
                sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(id)
                    .execute(&*self.db)
                    .await?;
                return Ok(PartRecord::Recorded);
            }

            let status = sqlx::query_scalar::<_, SessionStatus>(
                "SELECT status FROM upload_sessions WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
            match status {
                None => return Ok(PartRecord::UnknownSession),
                Some(SessionStatus::Uploading) => {}
                Some(other) => return Ok(PartRecord::NotUploading(other)),
            }

            let recorded = sqlx::query_scalar::<_, Option<String>>(
                "SELECT etag FROM upload_session_parts WHERE session_id = ? AND part_number = ?",
            )
            .bind(id)
            .bind(i64::from(part_number))
            .fetch_optional(&*self.db)
            .await?;
            match recorded {
                None => return Ok(PartRecord::UnknownPart),
                Some(Some(existing)) if existing == etag => return Ok(PartRecord::Unchanged),
                Some(Some(existing)) => return Ok(PartRecord::Conflict { recorded: existing }),
                // Reconciliation cleared the part between our two statements.
                Some(None) => continue,
            }
        }
        let status = sqlx::query_scalar::<_, SessionStatus>(
            "SELECT status FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(status.map_or(PartRecord::UnknownSession, PartRecord::NotUploading))
    }

    /// `uploading → completing`, taking the completion lease. Applies only
    /// when every part has an ETag.
    pub async fn claim_completion(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'completing', completion_stage = 'pending', lease_expires_at = ?, \
                 updated_at = ? \
             WHERE id = ? AND status = 'uploading' \
             AND NOT EXISTS (SELECT 1 FROM upload_session_parts \
                             WHERE session_id = ? AND etag IS NULL)",
        )
        .bind(lease_until)
        .bind(now)
        .bind(id)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Take over a `completing` session whose lease is free or lapsed.
    pub async fn claim_resume(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'completing' \
             AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
        )
        .bind(lease_until)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record that a completion step finished.
    pub async fn advance_stage(
        &self,
        id: Uuid,
        stage: CompletionStage,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET completion_stage = ?, updated_at = ? \
             WHERE id = ? AND status = 'completing'",
        )
        .bind(stage)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `completing → completed`.
    pub async fn finish_completion(
        &self,
        id: Uuid,
        video_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'completed', completion_stage = 'registered', video_id = ?, \
                 lease_expires_at = NULL, last_error = NULL, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'completing'",
        )
        .bind(video_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop the lease after a failed step; the session stays `completing`.
    pub async fn release_lease(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions \
             SET lease_expires_at = NULL, last_error = ?, retry_count = retry_count + 1, \
                 updated_at = ? \
             WHERE id = ? AND status = 'completing'",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// `completing → uploading` after the store rejected finalization, so the
    /// client can reconcile and try again.
    pub async fn revert_to_uploading(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions \
             SET status = 'uploading', completion_stage = 'pending', lease_expires_at = NULL, \
                 last_error = ?, retry_count = retry_count + 1, updated_at = ? \
             WHERE id = ? AND status = 'completing' AND completion_stage = 'pending'",
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move to `aborted` from any state that allows it.
    pub async fn abort(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE upload_sessions \
             SET status = 'aborted', lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND {}",
            TERMINABLE
        ))
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move to `expired` when `expires_at` has passed and the state allows it.
    pub async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE upload_sessions \
             SET status = 'expired', lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND expires_at <= ? AND {}",
            EXPIRABLE
        ))
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrite part ETags with the store's view and make sure the session
    /// is `uploading`. Applies only to `initiated`/`uploading` sessions.
    pub async fn apply_reconciliation(
        &self,
        id: Uuid,
        parts: &[(u32, Option<String>)],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let claimed = sqlx::query(
            "UPDATE upload_sessions SET status = 'uploading', updated_at = ? \
             WHERE id = ? AND status IN ('initiated', 'uploading')",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() != 1 {
            return Ok(false);
        }
        for (part_number, etag) in parts {
            sqlx::query(
                "UPDATE upload_session_parts SET etag = ?, reported_at = ? \
                 WHERE session_id = ? AND part_number = ?",
            )
            .bind(etag)
            .bind(etag.as_ref().map(|_| now))
            .bind(id)
            .bind(i64::from(*part_number))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Store freshly presigned part URLs for an `initiated`/`uploading` session.
    pub async fn update_part_urls(
        &self,
        id: Uuid,
        urls: &[(u32, String)],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let touched = sqlx::query(
            "UPDATE upload_sessions SET updated_at = ? \
             WHERE id = ? AND status IN ('initiated', 'uploading')",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() != 1 {
            return Ok(false);
        }
        for (part_number, url) in urls {
            sqlx::query(
                "UPDATE upload_session_parts SET upload_url = ? \
                 WHERE session_id = ? AND part_number = ?",
            )
            .bind(url)
            .bind(id)
            .bind(i64::from(*part_number))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}
