use spyglass_backend::config::Config;
use spyglass_backend::helpers;
use spyglass_backend::hub::Hub;
use spyglass_backend::monitor::{Monitor, MonitorConfig};
use spyglass_backend::retention::{Retention, RetentionConfig};
use spyglass_backend::sessions::SessionTracker;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Starting Spyglass monitor...");

    let config = Config::from_env();

    let db = spyglass_db::Database::open(&config.database_path)
        .await
        .expect("failed to open database");

    let hub = Hub::start(config.broadcast_buffer, config.client_buffer);

    // sweep sessions a previous run left open before any probing starts
    let tracker = SessionTracker::new(db.clone(), hub.clone());
    if let Err(e) = tracker.initialize(helpers::now()).await {
        error!("startup session sweep failed: {e}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Monitor::new(
        db.clone(),
        hub.clone(),
        Arc::clone(&tracker),
        MonitorConfig {
            interval: config.monitor_interval,
            ping_timeout: config.ping_timeout,
            max_concurrent: config.max_concurrent,
        },
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let retention = Retention::new(
        db.clone(),
        RetentionConfig {
            sample_ttl: config.sample_ttl,
            activity_ttl: config.activity_ttl,
            session_ttl: config.session_ttl,
            database_path: Some(PathBuf::from(&config.database_path)),
            backup_dir: PathBuf::from(&config.backup_dir),
        },
    );
    let retention_task = tokio::spawn(retention.run(shutdown_rx.clone()));

    let app = spyglass_backend::create_app(hub.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind listener");
    info!("Server listening on 0.0.0.0:{}", config.port);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut serve_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });
    if let Err(e) = server.await {
        error!("server error: {e}");
    }

    // in-flight probes drain first, then the hub releases its subscribers
    let _ = monitor_task.await;
    let _ = retention_task.await;
    hub.close().await;
    info!("Spyglass stopped");
}
