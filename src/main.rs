// Main entry point - Dependency injection and server setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};
use anyhow::Context;
use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::console_backend::ConsoleBackend;
use crate::application::console_service::ConsoleService;
use crate::application::session_store::SessionStore;
use crate::infrastructure::config::load_console_config;
use crate::infrastructure::http_backend::HttpConsoleBackend;
use crate::infrastructure::session_file::FileSessionStore;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    get_machine, health_check, machine_events, post_command, resync_machine, subscribe_machine,
    unsubscribe_machine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_console_config()?;

    // Create backend and session store (infrastructure layer)
    let backend: Arc<dyn ConsoleBackend> = Arc::new(HttpConsoleBackend::new(&config.backend)?);
    let sessions = Arc::new(FileSessionStore::new(config.session.state_path.clone()));
    match sessions.load().await {
        Ok(session) => tracing::info!(
            path = %sessions.path().display(),
            session_active = session.session_active,
            session_id = ?session.active_session_id,
            "Loaded operator session"
        ),
        Err(e) => tracing::warn!(path = %sessions.path().display(), error = %e, "Ignoring unreadable session file"),
    }

    // Create services (application layer)
    let console = Arc::new(ConsoleService::new(
        backend,
        sessions,
        config.reconciliation.settings(),
        config.stream.settings(),
    ));

    for machine_id in &config.device.machine_ids {
        console
            .subscribe(*machine_id)
            .await
            .with_context(|| format!("Failed to subscribe machine {}", machine_id))?;
        tracing::info!(machine_id = %machine_id, "Subscribed machine at startup");
    }

    // Create application state
    let state = Arc::new(AppState { console });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/machines/:id", get(get_machine))
        .route(
            "/machines/:id/subscription",
            put(subscribe_machine).delete(unsubscribe_machine),
        )
        .route("/machines/:id/resync", post(resync_machine))
        .route("/machines/:id/commands", post(post_command))
        .route("/machines/:id/events", get(machine_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;
    tracing::info!(%addr, "Starting line-console-sync service");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await?;

    Ok(())
}
