//! Health check handlers

use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: ReadyChecks,
}

/// Configuration the service is running with
#[derive(Serialize)]
pub struct ReadyChecks {
    pub search_index: String,
    pub oracle_model: String,
    pub rerank_strategy: &'static str,
    pub audit: &'static str,
    pub cached_identities: u64,
}

/// Liveness check - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: keystone_common::VERSION,
    })
}

/// Readiness check - reports the upstream wiring
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    let upstream = &state.config.upstream;

    Json(ReadyResponse {
        status: "ready".to_string(),
        checks: ReadyChecks {
            search_index: upstream.search_index_url.clone(),
            oracle_model: upstream.oracle_model.clone(),
            rerank_strategy: state.retrieval.rerank.strategy.as_str(),
            audit: if upstream.audit_url.is_some() { "http" } else { "log" },
            cached_identities: state.identity.cached_entries(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reports_version() {
        let Json(body) = tokio_test::block_on(health());
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, keystone_common::VERSION);
    }
}
