use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use quarterdeck::{
    cli::{run_tail_client, Cli, Commands},
    config::Config,
    gateway::{websocket_handler, Gateway},
    handlers::{get_stats, health_check, ingest_alert, ingest_deployment_update, ingest_pod_status},
    log_stream::LogStreamManager,
    orchestrator::HttpOrchestrator,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() {
    let telemetry = match Telemetry::init() {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("Failed to initialise telemetry: {}", e);
            std::process::exit(1);
        }
    };

    let cli = Cli::parse();

    // Check if running as debug tail client
    if let Some(Commands::Tail {
        url,
        namespace,
        pod,
        container,
    }) = cli.command
    {
        if let Err(e) = run_tail_client(url, namespace, pod, container).await {
            error!("Tail client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("Starting quarterdeck gateway on port {}", config.port);
    info!("Orchestration API: {}", config.orchestrator_url);
    info!("Historical line limit: {}", config.recent_line_limit);

    let orchestrator = match HttpOrchestrator::new(&config) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(e) => {
            error!("Failed to build orchestration API client: {}", e);
            std::process::exit(1);
        }
    };

    let streams = LogStreamManager::new(orchestrator, config.recent_line_limit);
    let gateway = Gateway::new(streams);

    let metrics_handle = telemetry.metrics_handle();
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/events/pod-status", post(ingest_pod_status))
        .route("/events/deployment-update", post(ingest_deployment_update))
        .route("/events/alert", post(ingest_alert))
        .route("/ws", get(websocket_handler))
        .with_state(gateway)
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("quarterdeck listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", err);
    }
}
