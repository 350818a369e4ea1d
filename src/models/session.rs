//! Upload sessions and their parts.
//!
//! `SessionRow` and `PartRow` mirror the SQLite columns; `UploadSession` is the
//! typed record the state machine works with. Conversion validates every
//! integer range so a corrupt row surfaces as a decode error instead of
//! leaking into session logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// `initiated → uploading → completing → completed`, with `aborted` and
/// `expired` as terminal failure states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    Uploading,
    Completing,
    Completed,
    Aborted,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Expired)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initiated" => Ok(Self::Initiated),
            "uploading" => Ok(Self::Uploading),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status `{}`", other)),
        }
    }
}

/// How far a `completing` session has progressed.
///
/// Steps run strictly in this order, so a resumed completion starts at the
/// first step whose stage has not been recorded yet.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CompletionStage {
    /// Multipart upload not yet finalized.
    Pending,
    /// Object assembled at the staging key.
    Finalized,
    /// Object copied to the library key.
    Promoted,
    /// Catalog row written.
    Registered,
}

impl CompletionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::Promoted => "promoted",
            Self::Registered => "registered",
        }
    }
}

/// One part of the plan, with its upload URL and the ETag once reported.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPart {
    pub part_number: u32,
    pub upload_url: String,
    pub etag: Option<String>,
}

/// A multipart upload session as seen by the state machine.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Session id; doubles as the id of the library entry it produces.
    pub id: Uuid,
    pub upload_id: String,
    pub staging_key: String,
    pub library_key: String,
    pub filename: String,
    pub content_type: String,
    pub file_size: u64,
    pub part_size: u64,
    pub part_count: u32,
    pub course_id: Option<Uuid>,
    pub module_id: Option<Uuid>,
    pub lesson_id: Option<Uuid>,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub completion_stage: CompletionStage,
    #[serde(skip)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub video_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub parts: Vec<SessionPart>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Part numbers that have no recorded ETag, ascending.
    pub fn missing_parts(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| p.etag.is_none())
            .map(|p| p.part_number)
            .collect()
    }

    pub fn parts_reported(&self) -> u32 {
        self.parts.iter().filter(|p| p.etag.is_some()).count() as u32
    }

    /// True while another request may be executing completion steps.
    pub fn lease_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|until| until > now)
    }
}

/// Raw `upload_sessions` row.
#[derive(Clone, FromRow, Debug)]
pub struct SessionRow {
    pub id: Uuid,
    pub upload_id: String,
    pub staging_key: String,
    pub library_key: String,
    pub filename: String,
    pub content_type: String,
    pub file_size: i64,
    pub part_size: i64,
    pub part_count: i64,
    pub course_id: Option<Uuid>,
    pub module_id: Option<Uuid>,
    pub lesson_id: Option<Uuid>,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub completion_stage: CompletionStage,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub video_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Raw `upload_session_parts` row.
#[derive(Clone, FromRow, Debug)]
pub struct PartRow {
    pub part_number: i64,
    pub upload_url: String,
    pub etag: Option<String>,
}

/// A stored row failed validation while mapping to the domain type.
#[derive(Debug, thiserror::Error)]
#[error("corrupt upload session row `{id}`: {reason}")]
pub struct RowDecodeError {
    pub id: Uuid,
    pub reason: String,
}

impl SessionRow {
    /// Combine the session row with its part rows into an [`UploadSession`].
    pub fn into_session(self, part_rows: Vec<PartRow>) -> Result<UploadSession, RowDecodeError> {
        let id = self.id;
        let corrupt = |reason: String| RowDecodeError { id, reason };

        let file_size = u64::try_from(self.file_size)
            .map_err(|_| corrupt(format!("negative file_size {}", self.file_size)))?;
        let part_size = u64::try_from(self.part_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| corrupt(format!("invalid part_size {}", self.part_size)))?;
        let part_count = u32::try_from(self.part_count)
            .map_err(|_| corrupt(format!("invalid part_count {}", self.part_count)))?;

        let mut parts = Vec::with_capacity(part_rows.len());
        for row in part_rows {
            let part_number = u32::try_from(row.part_number)
                .ok()
                .filter(|n| (1..=part_count).contains(n))
                .ok_or_else(|| corrupt(format!("part number {} out of range", row.part_number)))?;
            parts.push(SessionPart {
                part_number,
                upload_url: row.upload_url,
                etag: row.etag,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        if parts.len() != part_count as usize {
            return Err(corrupt(format!(
                "expected {} part rows, found {}",
                part_count,
                parts.len()
            )));
        }

        Ok(UploadSession {
            id,
            upload_id: self.upload_id,
            staging_key: self.staging_key,
            library_key: self.library_key,
            filename: self.filename,
            content_type: self.content_type,
            file_size,
            part_size,
            part_count,
            course_id: self.course_id,
            module_id: self.module_id,
            lesson_id: self.lesson_id,
            title: self.title,
            status: self.status,
            completion_stage: self.completion_stage,
            lease_expires_at: self.lease_expires_at,
            video_id: self.video_id,
            last_error: self.last_error,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            parts,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(part_count: i64) -> SessionRow {
        let now = Utc::now();
        SessionRow {
            id: Uuid::new_v4(),
            upload_id: "up-1".into(),
            staging_key: "staging/a/b.mp4".into(),
            library_key: "library/a/b.mp4".into(),
            filename: "b.mp4".into(),
            content_type: "video/mp4".into(),
            file_size: 20,
            part_size: 8,
            part_count,
            course_id: None,
            module_id: None,
            lesson_id: None,
            title: None,
            status: SessionStatus::Uploading,
            completion_stage: CompletionStage::Pending,
            lease_expires_at: None,
            video_id: None,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now,
            completed_at: None,
        }
    }

    fn part(n: i64, etag: Option<&str>) -> PartRow {
        PartRow {
            part_number: n,
            upload_url: format!("https://store/{}", n),
            etag: etag.map(str::to_string),
        }
    }

    #[test]
    fn maps_rows_and_orders_parts() {
        let session = row(3)
            .into_session(vec![part(3, None), part(1, Some("a")), part(2, None)])
            .unwrap();
        let numbers: Vec<u32> = session.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(session.missing_parts(), vec![2, 3]);
        assert_eq!(session.parts_reported(), 1);
    }

    #[test]
    fn rejects_out_of_range_part_rows() {
        let err = row(2)
            .into_session(vec![part(1, None), part(7, None)])
            .unwrap_err();
        assert!(err.reason.contains("out of range"));
    }

    #[test]
    fn rejects_missing_part_rows() {
        let err = row(3).into_session(vec![part(1, None)]).unwrap_err();
        assert!(err.reason.contains("expected 3 part rows"));
    }

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(!SessionStatus::Completing.is_terminal());
        assert_eq!("completing".parse(), Ok(SessionStatus::Completing));
    }
}
