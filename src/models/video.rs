//! Permanent video library entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Editorial workflow of a library video: `draft → review → approved → published`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Review,
    Approved,
    Published,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Approved => "approved",
            Self::Published => "published",
        }
    }

    /// Statuses an editor may move a video to from `self`.
    pub fn allowed_transitions(self) -> &'static [WorkflowStatus] {
        match self {
            Self::Draft => &[Self::Review],
            Self::Review => &[Self::Draft, Self::Approved],
            Self::Approved => &[Self::Review, Self::Published],
            // Unpublishing goes straight back to draft.
            Self::Published => &[Self::Draft],
        }
    }

    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catalog entry for a video whose bytes live at `library_key`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VideoLibraryEntry {
    pub id: Uuid,
    pub library_key: String,
    pub course_id: Option<Uuid>,
    pub module_id: Option<Uuid>,
    pub lesson_id: Option<Uuid>,
    pub title: String,
    pub original_filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// Filled in later once the media is inspected.
    pub duration_seconds: Option<f64>,
    pub workflow_status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editorial_transitions() {
        use WorkflowStatus::*;
        assert!(Draft.can_transition_to(Review));
        assert!(!Draft.can_transition_to(Published));
        assert!(!Draft.can_transition_to(Draft));
        assert!(Review.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Published));
        assert!(Published.can_transition_to(Draft));
        assert!(!Published.can_transition_to(Review));
    }
}
