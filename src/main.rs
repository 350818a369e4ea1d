use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use video_upload_sessions::{
    config, db,
    routes::routes,
    services::{
        gateway::StorageClient, notifier::TracingNotifier, registrar::VideoRegistrar,
        session_manager::SessionManager, session_store::SessionStore, sweeper::spawn_sweeper,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting video upload service with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object store ---
    let storage = StorageClient::connect(&cfg.storage, &cfg.uploads).await?;
    tracing::info!(provider = ?cfg.storage.provider, "object store ready");

    // --- Core services ---
    let manager = SessionManager::new(
        SessionStore::new(db.clone()),
        storage.gateway,
        VideoRegistrar::new(db.clone()),
        Arc::new(TracingNotifier),
        cfg.uploads.clone(),
    );
    let sweeper = spawn_sweeper(manager.clone(), cfg.sweep_interval);

    let state = AppState {
        manager,
        db,
        local_store: storage.local,
    };

    // --- Build router ---
    let app: Router = routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    sweeper.abort();

    Ok(())
}
