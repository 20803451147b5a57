//! Core records shared by every pipeline stage
//!
//! Everything here is a plain structured record with no transport types, so
//! the result can be wrapped by any HTTP, RPC, or CLI front end.

use crate::intent::QueryIntent;
use crate::search::IndexRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Sensitivity ladder. A user sees everything up to and including their clearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Clearance {
    /// Highest level on the ladder
    pub const MAX: Clearance = Clearance::Restricted;

    /// Numeric level used by index filters
    pub fn level(&self) -> u8 {
        match self {
            Clearance::Public => 0,
            Clearance::Internal => 1,
            Clearance::Confidential => 2,
            Clearance::Restricted => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Clearance::Public => "public",
            Clearance::Internal => "internal",
            Clearance::Confidential => "confidential",
            Clearance::Restricted => "restricted",
        }
    }
}

/// Requesting principal. Immutable for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityIdentity {
    user_id: String,
    tenant_id: String,
    groups: Vec<String>,
    clearance: Clearance,
    department: Option<String>,
}

impl SecurityIdentity {
    /// Build an identity. Group ids are trimmed, blanks dropped, and
    /// duplicates removed while keeping the resolver's order.
    pub fn new<I, S>(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        groups: I,
        clearance: Clearance,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = std::collections::HashSet::new();
        let groups = groups
            .into_iter()
            .map(|g| g.into().trim().to_string())
            .filter(|g| !g.is_empty())
            .filter(|g| seen.insert(g.clone()))
            .collect();

        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            groups,
            clearance,
            department: None,
        }
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        let department = department.into();
        self.department = if department.trim().is_empty() {
            None
        } else {
            Some(department)
        };
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn clearance(&self) -> Clearance {
        self.clearance
    }

    pub fn department(&self) -> Option<&str> {
        self.department.as_deref()
    }
}

/// Structural type of a chunk as produced by ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Table,
    ImageCaption,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

/// Security metadata attached to every indexed chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSecurity {
    pub tenant_id: String,
    pub active: bool,
    pub sensitivity: Clearance,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub department: Option<String>,
}

/// Hallucination-risk tag from the full-analysis rerank strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HallucinationRisk {
    Low,
    Medium,
    High,
}

impl HallucinationRisk {
    /// Multiplier applied to the judged relevance
    pub fn discount(&self) -> f64 {
        match self {
            HallucinationRisk::Low => 1.0,
            HallucinationRisk::Medium => 0.9,
            HallucinationRisk::High => 0.7,
        }
    }
}

/// Scores accumulated as a chunk moves through the pipeline.
///
/// `final_score` always holds the score the current stage ranks by.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBundle {
    /// Best raw score seen in any vector list
    pub vector_score: Option<f64>,
    /// Best raw score seen in any lexical list
    pub lexical_score: Option<f64>,
    /// Normalized RRF score, top result is 1.0
    pub rrf_score: f64,
    pub boosted_score: f64,
    /// Semantic-ranker hint supplied by the index
    pub semantic_score: Option<f64>,
    /// Judged relevance on the 0-3 scale, after any risk discount
    pub rerank_score: Option<f64>,
    /// Judged explicit-evidence support on the 0-1 scale
    pub support_score: Option<f64>,
    pub explicit_evidence: Option<bool>,
    pub hallucination_risk: Option<HallucinationRisk>,
    pub final_score: f64,
}

/// A retrievable passage with its structural, security, and score metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub section_path: Vec<String>,
    pub reading_order: u32,
    pub page_range: Option<PageRange>,
    pub token_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
    pub security: ChunkSecurity,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub scores: ScoreBundle,
    /// Anchor chunk id when this chunk was pulled in by neighbor stitching
    pub stitched_from: Option<String>,
    /// Content was cut to fit the context budget
    pub truncated: bool,
}

impl RetrievedChunk {
    /// First observation of a chunk in a search result
    pub fn from_row(row: &IndexRow) -> Self {
        let token_count = row
            .token_count
            .unwrap_or_else(|| estimate_tokens(&row.content));

        Self {
            id: row.id.clone(),
            document_id: row.document_id.clone(),
            content: row.content.clone(),
            content_type: row.content_type,
            section_path: row.section_path.clone(),
            reading_order: row.reading_order,
            page_range: row.page_range,
            token_count,
            updated_at: row.updated_at,
            security: row.security.clone(),
            attributes: row.attributes.clone(),
            scores: ScoreBundle {
                semantic_score: row.semantic_score,
                ..ScoreBundle::default()
            },
            stitched_from: None,
            truncated: false,
        }
    }

    pub fn is_neighbor(&self) -> bool {
        self.stitched_from.is_some()
    }
}

/// Estimate token count (simple approximation)
pub fn estimate_tokens(text: &str) -> usize {
    // Rough estimate: 1 token ~= 4 characters
    text.len().div_ceil(4)
}

/// Descending score, then reading order, then chunk id
pub fn score_order(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    b.scores
        .final_score
        .total_cmp(&a.scores.final_score)
        .then_with(|| a.reading_order.cmp(&b.reading_order))
        .then_with(|| a.id.cmp(&b.id))
}

/// Document id, then reading order, then chunk id
pub fn document_order(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    a.document_id
        .cmp(&b.document_id)
        .then_with(|| a.reading_order.cmp(&b.reading_order))
        .then_with(|| a.id.cmp(&b.id))
}

/// Stable sort by `final_score` with deterministic tie-breaks
pub fn sort_by_score(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(score_order);
}

/// Pipeline states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStage {
    Route,
    Expand,
    BuildAcl,
    Search,
    Fuse,
    Boost,
    Rerank,
    Stitch,
    Budget,
    Done,
}

impl RetrievalStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStage::Route => "route",
            RetrievalStage::Expand => "expand",
            RetrievalStage::BuildAcl => "build_acl",
            RetrievalStage::Search => "search",
            RetrievalStage::Fuse => "fuse",
            RetrievalStage::Boost => "boost",
            RetrievalStage::Rerank => "rerank",
            RetrievalStage::Stitch => "stitch",
            RetrievalStage::Budget => "budget",
            RetrievalStage::Done => "done",
        }
    }
}

/// Category of a partial degradation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SearchCallFailed,
    SearchTimeout,
    AclTruncated,
    AclViolation,
    RerankFallback,
    RerankSkipped,
    StitchTruncated,
    StitchSkipped,
    BudgetTruncated,
    DeadlineExhausted,
    AuditDelivery,
    EmptyResult,
}

/// A degradation recorded as data rather than raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalWarning {
    pub stage: RetrievalStage,
    pub kind: WarningKind,
    pub message: String,
}

impl RetrievalWarning {
    pub fn new(stage: RetrievalStage, kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RetrievalWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: RetrievalStage,
    pub duration_ms: f64,
}

/// Extra equality filter AND-ed onto the access predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub values: Vec<String>,
}

impl FieldFilter {
    pub fn new<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// One retrieval call
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    /// Upper bound on the whole call, measured from its start
    pub deadline: Option<Duration>,
    pub filters: Vec<FieldFilter>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            deadline: None,
            filters: Vec::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// Summary of the access decision that scoped the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclSummary {
    pub strategy: crate::acl::AclStrategy,
    pub groups_included: usize,
    pub groups_truncated: usize,
    pub predicate_fingerprint: String,
}

/// The sole output of the retrieval core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub request_id: Uuid,
    pub chunks: Vec<RetrievedChunk>,
    pub rewritten_queries: Vec<String>,
    pub intent: QueryIntent,
    pub acl: AclSummary,
    pub total_tokens: usize,
    pub timings: Vec<StageTiming>,
    pub warnings: Vec<RetrievalWarning>,
}

impl RetrievalResult {
    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clearance_ordering() {
        assert!(Clearance::Public < Clearance::Internal);
        assert!(Clearance::Confidential < Clearance::Restricted);
        assert_eq!(Clearance::MAX, Clearance::Restricted);
        assert_eq!(Clearance::Confidential.level(), 2);
    }

    #[test]
    fn test_identity_dedupes_groups_in_order() {
        let identity = SecurityIdentity::new(
            "u1",
            "acme",
            ["eng", " ops ", "eng", "", "finance"],
            Clearance::Internal,
        );
        assert_eq!(identity.groups(), &["eng", "ops", "finance"]);
        assert_eq!(identity.department(), None);
    }

    #[test]
    fn test_blank_department_is_none() {
        let identity =
            SecurityIdentity::new("u1", "acme", Vec::<String>::new(), Clearance::Public)
                .with_department("  ");
        assert_eq!(identity.department(), None);
    }

    #[test]
    fn test_token_estimation() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
