//! Search index abstraction and concurrent fan-out
//!
//! The index is a black box offering two ranked query modes against an
//! access predicate:
//! - Vector search (semantic similarity)
//! - Lexical search (keyword matching)

mod executor;
mod http;
mod memory;

pub use executor::SearchExecutor;
pub use http::HttpSearchIndex;
pub use memory::MockSearchIndex;

use crate::acl::AccessPredicate;
use crate::model::{ChunkSecurity, ContentType, PageRange, RetrievalWarning};
use chrono::{DateTime, Utc};
use keystone_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Search modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Vector similarity search
    Vector,
    /// Keyword search
    Lexical,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Vector => "vector",
            Modality::Lexical => "lexical",
        }
    }
}

/// Largest list-membership clause the index accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateCapacity {
    Unlimited,
    Limited(usize),
}

/// One row returned by the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Raw modality score, only comparable within one list
    pub score: f64,
    pub content_type: ContentType,
    #[serde(default)]
    pub section_path: Vec<String>,
    pub reading_order: u32,
    #[serde(default)]
    pub page_range: Option<PageRange>,
    #[serde(default)]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Semantic-ranker hint in [0, 1]
    #[serde(default)]
    pub semantic_score: Option<f64>,
    pub security: ChunkSecurity,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A row with its 1-based rank inside its own list
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    pub rank: usize,
    pub row: IndexRow,
}

/// Results of one (variant, modality) call
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub variant_index: usize,
    pub modality: Modality,
    pub hits: Vec<RankedHit>,
}

/// Output of the SEARCH stage
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub lists: Vec<RankedList>,
    pub calls_attempted: usize,
    pub calls_failed: usize,
    pub warnings: Vec<RetrievalWarning>,
}

impl SearchOutcome {
    pub fn candidate_count(&self) -> usize {
        self.lists.iter().map(|l| l.hits.len()).sum()
    }
}

/// External search index
#[async_trait::async_trait]
pub trait SearchIndex: Send + Sync {
    /// Ranked rows for `query`, best first, scoped by `predicate`
    async fn search(
        &self,
        modality: Modality,
        query: &str,
        predicate: &AccessPredicate,
        top_k: usize,
    ) -> Result<Vec<IndexRow>>;

    /// Rows of one document section whose reading order lies in `orders`
    async fn neighbors(
        &self,
        document_id: &str,
        section_path: &[String],
        orders: RangeInclusive<u32>,
        predicate: &AccessPredicate,
    ) -> Result<Vec<IndexRow>>;

    /// List-size limit for membership clauses
    fn predicate_capacity(&self) -> PredicateCapacity {
        PredicateCapacity::Unlimited
    }

    fn name(&self) -> &str;
}
