use crate::services::{gateway::local::LocalObjectStore, session_manager::SessionManager};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub db: Arc<SqlitePool>,
    /// Present when the local provider is active; its data plane is served
    /// by this process under `/store`.
    pub local_store: Option<Arc<LocalObjectStore>>,
}
