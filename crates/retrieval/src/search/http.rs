//! HTTP client for a remote search index
//!
//! The access predicate travels as a rendered filter string; the index
//! applies it and returns rows with their security metadata attached.

use super::{IndexRow, Modality, PredicateCapacity, SearchIndex};
use crate::acl::AccessPredicate;
use keystone_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

const SERVICE: &str = "search_index";

/// Search index reached over HTTP
pub struct HttpSearchIndex {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    capacity: PredicateCapacity,
}

#[derive(Serialize)]
struct SearchRequestBody<'a> {
    mode: Modality,
    query: &'a str,
    filter: String,
    top: usize,
}

#[derive(Serialize)]
struct NeighborRequestBody<'a> {
    document_id: &'a str,
    section_path: &'a [String],
    from_order: u32,
    to_order: u32,
    filter: String,
}

#[derive(Deserialize)]
struct RowsResponse {
    rows: Vec<IndexRow>,
}

impl HttpSearchIndex {
    pub fn new(base_url: impl Into<String>, timeout: Duration, capacity: PredicateCapacity) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            capacity,
        })
    }

    async fn post_rows<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Vec<IndexRow>> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::upstream_request(SERVICE, self.timeout, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(SERVICE, format!("API error {}: {}", status, body)));
        }

        let parsed: RowsResponse = response
            .json()
            .await
            .map_err(|e| AppError::upstream(SERVICE, format!("Failed to parse response: {}", e)))?;

        Ok(parsed.rows)
    }
}

#[async_trait::async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn search(
        &self,
        modality: Modality,
        query: &str,
        predicate: &AccessPredicate,
        top_k: usize,
    ) -> Result<Vec<IndexRow>> {
        let body = SearchRequestBody {
            mode: modality,
            query,
            filter: predicate.render(),
            top: top_k,
        };
        self.post_rows("/search", &body).await
    }

    async fn neighbors(
        &self,
        document_id: &str,
        section_path: &[String],
        orders: RangeInclusive<u32>,
        predicate: &AccessPredicate,
    ) -> Result<Vec<IndexRow>> {
        let body = NeighborRequestBody {
            document_id,
            section_path,
            from_order: *orders.start(),
            to_order: *orders.end(),
            filter: predicate.render(),
        };
        self.post_rows("/neighbors", &body).await
    }

    fn predicate_capacity(&self) -> PredicateCapacity {
        self.capacity
    }

    fn name(&self) -> &str {
        "http"
    }
}
