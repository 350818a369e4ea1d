//! Resumable multipart video uploads: sessions over an object store, tracked
//! in SQLite and promoted into the course video library once complete.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
