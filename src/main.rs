use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use diamond_media::app_state::AppState;
use diamond_media::config::AppConfig;
use diamond_media::db::{self, memory::MemoryStatusStore, queries::PgStatusStore};
use diamond_media::routes;
use diamond_media::services::{
    formats::FormatPolicy,
    imports::ImportService,
    pipeline::{ImportPipeline, RetryPolicy},
    queue::TaskQueue,
    recovery::RecoveryScanner,
    storage::S3FileStore,
    store::StatusStore,
    temp_cleaner::TempCleaner,
    transcoder::MediaTranscoder,
    worker::Worker,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(env = ?config.app_env, "Initializing media import service");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("media_import_tasks_submitted", "Import tasks accepted");
    metrics::describe_counter!("media_import_items_completed", "Items imported successfully");
    metrics::describe_counter!("media_import_items_failed", "Items that failed to import");
    metrics::describe_histogram!(
        "media_import_item_seconds",
        "Time to import a single item"
    );
    metrics::describe_gauge!(
        "media_import_queue_depth",
        "Import tasks waiting for the worker"
    );
    metrics::describe_counter!(
        "media_import_temp_files_deleted",
        "Orphaned upload temp files removed by the sweeper"
    );

    // ── Status store ───────────────────────────────────────────────────
    let store: Arc<dyn StatusStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url).await.expect("Failed to connect to database");
            tracing::info!("Running database migrations");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            Arc::new(PgStatusStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, import status is kept in memory only");
            Arc::new(MemoryStatusStore::new())
        }
    };

    // ── Import pipeline ────────────────────────────────────────────────
    tracing::info!("Initializing object storage client");
    let remote = S3FileStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    let policy = Arc::new(FormatPolicy::from_config(&config).expect("Invalid media format configuration"));
    let uploads_dir = config.upload_temp_dir.join("uploads");
    let scratch_dir = config.upload_temp_dir.join("scratch");
    tokio::fs::create_dir_all(&uploads_dir)
        .await
        .expect("Failed to create upload temp directory");

    let pipeline = ImportPipeline::new(
        Arc::new(MediaTranscoder::new(&config.ffmpeg_path)),
        Arc::new(remote),
        policy.clone(),
        scratch_dir,
    )
    .with_retry(RetryPolicy {
        retries: config.transient_retry_limit,
        backoff: config.transient_retry_backoff(),
    })
    .with_item_timeout(config.item_timeout());

    let queue = Arc::new(TaskQueue::new(store.clone()));
    let shutdown = CancellationToken::new();

    // ── Background tasks ───────────────────────────────────────────────
    let worker = Worker::new(store.clone(), queue.clone(), Arc::new(pipeline));
    let worker_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run(shutdown.clone()).await {
                tracing::error!(error = %e, "Import worker stopped on status store failure");
                shutdown.cancel();
            }
        })
    };

    if config.recovery_enabled() {
        let recovered = RecoveryScanner::new(store.clone(), queue.clone())
            .run_once()
            .await
            .expect("Failed to recover interrupted import tasks");
        tracing::info!(recovered, "Startup recovery complete");
    } else {
        tracing::info!("Skipping startup recovery outside production");
    }

    let cleaner = TempCleaner::new(
        store.clone(),
        uploads_dir.clone(),
        config.temp_retention(),
        config.temp_sweep_interval(),
    );
    let cleaner_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { cleaner.run(shutdown).await })
    };

    // ── HTTP surface ───────────────────────────────────────────────────
    let imports = ImportService::new(store.clone(), queue.clone(), policy, uploads_dir);
    let state = AppState::new(store, queue.clone(), imports);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/imports", post(routes::imports::submit_import))
        .route(
            "/api/v1/imports/{task_id}",
            get(routes::imports::get_import_status),
        )
        .route(
            "/api/v1/imports/{task_id}/restart",
            post(routes::imports::restart_import),
        )
        .route(
            "/api/v1/games/{game_id}/imports",
            post(routes::imports::submit_game_import),
        )
        .route(
            "/api/v1/games/{game_id}/imports/active",
            get(routes::imports::get_active_import),
        )
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .expect("Server error");

    queue.stop().await;
    let _ = worker_handle.await;
    let _ = cleaner_handle.await;
    tracing::info!("Media import service stopped");
}
