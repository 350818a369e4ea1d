//! Object key layout.
//!
//! Uploads land under `staging/`, promoted videos under `library/`. Both keys
//! are derived once when the session is created.

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

pub const STAGING_PREFIX: &str = "staging";
pub const LIBRARY_PREFIX: &str = "library";

/// Lowercase, keep `[a-z0-9-_.]`, collapse everything else into single dashes.
pub fn sanitize_key(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out
        .trim_matches(|c| c == '-' || c == '.')
        .replace("..", ".");
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed
    }
}

/// `staging/{video_id}/{filename}`
pub fn staging_key(video_id: Uuid, filename: &str) -> String {
    format!("{}/{}/{}", STAGING_PREFIX, video_id, sanitize_key(filename))
}

/// Course videos go under `library/courses/{course}/{video}/`, unassigned ones
/// under `library/standalone/{yyyy}/{mm}/{video}/`.
pub fn library_key(
    course_id: Option<Uuid>,
    video_id: Uuid,
    filename: &str,
    now: DateTime<Utc>,
) -> String {
    let file = sanitize_key(filename);
    match course_id {
        Some(course) => format!("{}/courses/{}/{}/{}", LIBRARY_PREFIX, course, video_id, file),
        None => format!(
            "{}/standalone/{}/{:02}/{}/{}",
            LIBRARY_PREFIX,
            now.year(),
            now.month(),
            video_id,
            file
        ),
    }
}

/// Lowercased extension of `filename`, if any.
pub fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}
