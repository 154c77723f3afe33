use std::sync::Arc;

use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use batch_annotate::app_state::AppState;
use batch_annotate::config::AppConfig;
use batch_annotate::routes;
use batch_annotate::services::{
    annotation_client::AnnotationClient,
    clock::{Clock, SystemClock},
    job_store::JobStore,
    processor::BatchProcessor,
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

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(tier = %config.service_tier, "Initializing batch-annotate server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!(endpoint = %config.generator_url, "Initializing annotation provider client");
    let generator = AnnotationClient::new(
        config.generator_url.clone(),
        config.generator_api_token.clone(),
        config.call_timeout(),
    )
    .expect("Failed to initialize annotation provider client");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processor = BatchProcessor::new(
        config.processor_config(),
        Arc::new(JobStore::new()),
        Arc::new(generator),
        clock,
    );
    let state = AppState::new(processor);

    // Periodically drop finished jobs
    let sweeper = Arc::clone(&state.processor);
    let ttl = config.job_ttl();
    let every = config.cleanup_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            sweeper.purge_finished(ttl);
        }
    });

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
