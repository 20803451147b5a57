//! Keystone API Gateway
//!
//! The HTTP entry point for the retrieval core.
//! Handles:
//! - Request validation and identity resolution
//! - Wiring the orchestrator to its upstream services
//! - Observability (logging, metrics, request ids)

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use keystone_common::{config::AppConfig, metrics};
use keystone_retrieval::{
    AuditSink, CachedIdentityResolver, HttpAuditSink, HttpIdentityResolver, HttpRelevanceOracle,
    HttpSearchIndex, HybridRetrievalOrchestrator, PredicateCapacity, RetrievalConfig, RetrievalServices,
    TracingAuditSink,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub retrieval: Arc<RetrievalConfig>,
    pub orchestrator: Arc<HybridRetrievalOrchestrator>,
    pub identity: Arc<CachedIdentityResolver>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config);

    info!(
        service = %config.observability.service_name,
        "Starting Keystone API Gateway v{}",
        keystone_common::VERSION
    );

    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus exporter listening on {}", addr);
    }
    metrics::register_metrics();

    // Validated once; handlers share it
    let retrieval = RetrievalConfig::new(config.retrieval.clone()).map_err(|e| {
        tracing::error!(error = %e, "Invalid retrieval configuration");
        e
    })?;

    let state = build_state(Arc::new(config), retrieval)?;
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Construct the upstream clients and the orchestrator
fn build_state(config: Arc<AppConfig>, retrieval: RetrievalConfig) -> keystone_common::Result<AppState> {
    let upstream = &config.upstream;
    let timeout = Duration::from_millis(upstream.timeout_ms);

    let capacity = match upstream.search_index_group_limit {
        Some(limit) => PredicateCapacity::Limited(limit),
        None => PredicateCapacity::Unlimited,
    };
    let index = Arc::new(HttpSearchIndex::new(upstream.search_index_url.clone(), timeout, capacity)?);

    let oracle = Arc::new(HttpRelevanceOracle::new(
        upstream.oracle_url.clone(),
        upstream.oracle_model.clone(),
        upstream.oracle_api_key.clone(),
        timeout,
    )?);

    let audit: Arc<dyn AuditSink> = match &upstream.audit_url {
        Some(url) => Arc::new(HttpAuditSink::new(url.clone(), timeout)?),
        None => {
            tracing::warn!("No audit URL configured; audit events go to the log only");
            Arc::new(TracingAuditSink)
        }
    };

    let identity = Arc::new(CachedIdentityResolver::new(
        Arc::new(HttpIdentityResolver::new(&upstream.identity_url, timeout)?),
        config.identity_ttl(),
        config.identity_cache.max_capacity,
    ));

    let orchestrator = HybridRetrievalOrchestrator::new(RetrievalServices {
        index,
        oracle,
        audit,
        identity: Some(identity.clone()),
    });

    Ok(AppState {
        config,
        retrieval: Arc::new(retrieval),
        orchestrator: Arc::new(orchestrator),
        identity,
    })
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .route("/retrieve", post(handlers::retrieve::retrieve));

    Router::new()
        .nest("/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(state.config.request_timeout()))
                .layer(cors),
        )
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
