//! Retrieval handler

use axum::{extract::State, Json};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

use crate::AppState;
use keystone_common::{
    errors::{AppError, Result},
    metrics,
};
use keystone_retrieval::model::FieldFilter;
use keystone_retrieval::{RetrievalRequest, RetrievalResult};

/// Retrieval request body
#[derive(Debug, Deserialize, Validate)]
pub struct RetrieveRequest {
    #[validate(length(min = 1, max = 2000))]
    pub query: String,

    #[validate(length(min = 1, max = 128))]
    pub tenant_id: String,

    #[validate(length(min = 1, max = 256))]
    pub user_id: String,

    /// Whole-call deadline; the server default applies when absent
    #[validate(range(min = 1, max = 120000))]
    pub deadline_ms: Option<u64>,

    /// Extra equality filters AND-ed onto the access predicate
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
}

impl RetrieveRequest {
    fn into_request(self, default_deadline: Duration) -> RetrievalRequest {
        let deadline = self
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(default_deadline);

        let mut request = RetrievalRequest::new(self.query).with_deadline(deadline);
        request.filters = self.filters;
        request
    }
}

/// Retrieve ACL-scoped, ranked context for one query
pub async fn retrieve(
    State(state): State<AppState>,
    Json(body): Json<RetrieveRequest>,
) -> Result<Json<RetrievalResult>> {
    let timer = metrics::RequestMetrics::start("POST", "/v1/retrieve");

    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let user_id = body.user_id.clone();
    let tenant_id = body.tenant_id.clone();
    let request = body.into_request(state.config.default_deadline());

    let result = state
        .orchestrator
        .retrieve_for_user(&request, &user_id, &tenant_id, &state.retrieval)
        .await;

    match &result {
        Ok(r) => {
            tracing::info!(
                request_id = %r.request_id,
                tenant_id = %tenant_id,
                chunks = r.chunks.len(),
                warnings = r.warnings.len(),
                "Retrieve request served"
            );
            timer.finish(200);
        }
        Err(e) => timer.finish(e.status_code().as_u16()),
    }

    Ok(Json(result?))
}
