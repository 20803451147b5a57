//! Keystone Retrieval
//!
//! Security-trimmed hybrid retrieval core for enterprise question answering.
//! Given a query and a security identity, produces a ranked, ACL-scoped,
//! token-budgeted set of passages:
//! - Intent routing and query expansion
//! - Bounded-size access predicates with overflow strategies
//! - Concurrent vector + lexical search with partial-failure tolerance
//! - Weighted RRF fusion and structural boosting
//! - Oracle-judged reranking with neutral fallbacks
//! - Neighbor stitching and context budgeting

pub mod acl;
pub mod audit;
pub mod boost;
pub mod budget;
pub mod config;
pub mod expansion;
pub mod fusion;
pub mod identity;
pub mod intent;
pub mod model;
pub mod orchestrator;
pub mod rerank;
pub mod search;
pub mod stitch;

pub use acl::{AccessPredicate, AclFilterBuilder, AclFilterResult, AclStrategy, GroupSelectionPolicy};
pub use audit::{AuditEvent, AuditSink, HttpAuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::RetrievalConfig;
pub use identity::{CachedIdentityResolver, HttpIdentityResolver, IdentityResolver, StaticIdentityResolver};
pub use intent::{QueryIntent, QueryIntentRouter};
pub use model::{
    Clearance, RetrievalRequest, RetrievalResult, RetrievalWarning, RetrievedChunk, SecurityIdentity,
    WarningKind,
};
pub use orchestrator::{HybridRetrievalOrchestrator, RetrievalServices};
pub use rerank::{HttpRelevanceOracle, MockRelevanceOracle, RelevanceOracle};
pub use search::{HttpSearchIndex, MockSearchIndex, PredicateCapacity, SearchIndex};
