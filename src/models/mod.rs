//! Core data models for the upload session service.
//!
//! Sessions track one multipart upload from creation to promotion; library
//! entries are the permanent catalog rows produced by a completed session.
//! Both map to SQLite tables via `sqlx::FromRow` and serialize as JSON via
//! `serde`.

pub mod session;
pub mod video;
