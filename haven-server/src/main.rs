use haven_server::config::AppConfig;
use haven_server::db;
use haven_server::db::connection::create_pool;
use haven_server::db::migrate::migrate;
use haven_server::models::token;
use haven_server::routes;
use haven_server::services::task_reaper::start_task_reaper;
use haven_server::state::AppState;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("Starting Haven control server on port {}", config.port);

    // Ensure the data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path);
    migrate(&pool)?;

    // First-run provisioning: identity lives elsewhere, so an operator can
    // seed one known token through the environment.
    if let (Some(tok), Some(user)) = (&config.bootstrap_token, &config.bootstrap_user) {
        let conn = pool.get()?;
        token::store(&conn, tok, user, "bootstrap")?;
        tracing::info!("Seeded bootstrap API token for user {}", user);
    }

    // Build application state
    let state = Arc::new(AppState::new(pool, config.clone()));

    // Start the lease reaper
    let cancel = CancellationToken::new();
    start_task_reaper(state.clone(), cancel.clone());

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();

    // Close database
    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
