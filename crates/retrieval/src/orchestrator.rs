//! Hybrid retrieval orchestrator
//!
//! One request-scoped pipeline:
//!
//! ROUTE -> EXPAND -> BUILD_ACL -> SEARCH -> FUSE -> BOOST -> RERANK -> STITCH -> BUDGET -> DONE
//!
//! Only an unbuildable predicate, a failed mandatory audit, an exhausted
//! deadline before SEARCH, or a total SEARCH failure end the request with an
//! error. Every other degradation is carried as a warning on the result.

use crate::acl::{AclFilterBuilder, AclFilterResult, DeclaredOrder, GroupSelectionPolicy};
use crate::audit::{AuditEvent, AuditSink, RetrievalAuditRecord};
use crate::boost::StructuralBooster;
use crate::budget::ContextBudgetAssembler;
use crate::config::RetrievalConfig;
use crate::expansion::QueryExpander;
use crate::fusion::RankFusionEngine;
use crate::identity::CachedIdentityResolver;
use crate::intent::QueryIntentRouter;
use crate::model::{
    RetrievalRequest, RetrievalResult, RetrievalStage, RetrievalWarning, RetrievedChunk,
    SecurityIdentity, StageTiming, WarningKind,
};
use crate::rerank::{CrossEncoderReranker, RelevanceOracle};
use crate::search::{SearchExecutor, SearchIndex};
use crate::stitch::NeighborStitcher;
use chrono::Utc;
use keystone_common::errors::{AppError, Result};
use keystone_common::metrics;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// External collaborators, constructed by the caller and injected
#[derive(Clone)]
pub struct RetrievalServices {
    pub index: Arc<dyn SearchIndex>,
    pub oracle: Arc<dyn RelevanceOracle>,
    pub audit: Arc<dyn AuditSink>,
    /// Needed only by [`HybridRetrievalOrchestrator::retrieve_for_user`]
    pub identity: Option<Arc<CachedIdentityResolver>>,
}

/// Composes every retrieval stage into one call
pub struct HybridRetrievalOrchestrator {
    router: QueryIntentRouter,
    expander: QueryExpander,
    index: Arc<dyn SearchIndex>,
    executor: SearchExecutor,
    reranker: CrossEncoderReranker,
    stitcher: NeighborStitcher,
    audit: Arc<dyn AuditSink>,
    identity: Option<Arc<CachedIdentityResolver>>,
    group_policy: Arc<dyn GroupSelectionPolicy>,
}

/// Per-request stage bookkeeping
struct StageClock {
    timings: Vec<StageTiming>,
}

impl StageClock {
    fn finish(&mut self, stage: RetrievalStage, started: Instant) {
        let elapsed = started.elapsed();
        metrics::record_stage(stage.as_str(), elapsed.as_secs_f64());
        self.timings.push(StageTiming {
            stage,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        });
    }
}

impl HybridRetrievalOrchestrator {
    pub fn new(services: RetrievalServices) -> Self {
        Self {
            router: QueryIntentRouter::new(),
            expander: QueryExpander::new(),
            executor: SearchExecutor::new(services.index.clone()),
            reranker: CrossEncoderReranker::new(services.oracle),
            stitcher: NeighborStitcher::new(services.index.clone()),
            index: services.index,
            audit: services.audit,
            identity: services.identity,
            group_policy: Arc::new(DeclaredOrder),
        }
    }

    /// Group selection used by the ACL fallback strategy
    pub fn with_group_policy(mut self, policy: Arc<dyn GroupSelectionPolicy>) -> Self {
        self.group_policy = policy;
        self
    }

    pub fn with_expander(mut self, expander: QueryExpander) -> Self {
        self.expander = expander;
        self
    }

    /// Resolve the identity through the cache, then [`Self::retrieve`]
    pub async fn retrieve_for_user(
        &self,
        request: &RetrievalRequest,
        user_id: &str,
        tenant_id: &str,
        config: &RetrievalConfig,
    ) -> Result<RetrievalResult> {
        let resolver = self
            .identity
            .as_ref()
            .ok_or_else(|| AppError::configuration("no identity resolver configured"))?;
        let identity = resolver.identity(user_id, tenant_id).await?;
        self.retrieve(request, &identity, config).await
    }

    /// Run the full pipeline for one query
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        identity: &SecurityIdentity,
        config: &RetrievalConfig,
    ) -> Result<RetrievalResult> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let span = tracing::info_span!(
            "retrieve",
            request_id = %request_id,
            tenant_id = %identity.tenant_id(),
        );

        let result = self
            .run(request_id, request, identity, config, started)
            .instrument(span)
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(r) => metrics::record_retrieval(elapsed, r.intent.as_str(), r.chunks.len(), "success"),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Retrieval failed");
                metrics::record_retrieval(elapsed, "unknown", 0, "error");
            }
        }

        result
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: &RetrievalRequest,
        identity: &SecurityIdentity,
        config: &RetrievalConfig,
        started: Instant,
    ) -> Result<RetrievalResult> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(AppError::Validation {
                message: "query must not be empty".to_string(),
                field: Some("query".to_string()),
            });
        }

        let deadline = request.deadline.map(|d| started + d);
        let mut clock = StageClock { timings: Vec::new() };
        let mut warnings: Vec<RetrievalWarning> = Vec::new();

        // ROUTE
        let t = Instant::now();
        let routed = self.router.route(query);
        let intent = routed.intent;
        let tuned = config.with_override(&routed.overrides)?;
        clock.finish(RetrievalStage::Route, t);

        // EXPAND
        let t = Instant::now();
        let variants = self.expander.expand(query, intent, tuned.max_query_variants);
        clock.finish(RetrievalStage::Expand, t);

        // BUILD_ACL
        let t = Instant::now();
        let acl = AclFilterBuilder::new(
            tuned.max_acl_group_predicate_size,
            self.index.predicate_capacity(),
            self.audit.clone(),
        )
        .with_policy(self.group_policy.clone())
        .build(identity, &request.filters)
        .instrument(tracing::debug_span!("build_acl"))
        .await?;
        warnings.extend(acl.warnings.iter().cloned());
        clock.finish(RetrievalStage::BuildAcl, t);

        // SEARCH
        if is_expired(deadline) {
            return Err(AppError::DeadlineExceeded {
                deadline_ms: deadline_ms(request),
            });
        }
        let t = Instant::now();
        let outcome = self
            .executor
            .execute(&variants, &acl, &tuned, deadline)
            .instrument(tracing::debug_span!("search", variants = variants.len()))
            .await?;
        warnings.extend(outcome.warnings.iter().cloned());
        clock.finish(RetrievalStage::Search, t);

        // FUSE
        let t = Instant::now();
        let mut chunks = RankFusionEngine::from_config(&tuned).fuse(&outcome.lists);
        clock.finish(RetrievalStage::Fuse, t);

        // BOOST
        let t = Instant::now();
        StructuralBooster::from_config(&tuned).apply(&mut chunks, intent, Utc::now());
        clock.finish(RetrievalStage::Boost, t);

        // RERANK
        let t = Instant::now();
        if is_expired(deadline) && tuned.rerank_enabled() {
            tracing::warn!("Deadline exhausted before rerank; keeping boosted order");
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Rerank,
                WarningKind::RerankSkipped,
                "request deadline exhausted before reranking; boosted order kept",
            ));
            chunks.truncate(tuned.final_top_k);
        } else {
            let reranked = self
                .reranker
                .rerank(query, chunks, &tuned, deadline)
                .instrument(tracing::debug_span!("rerank", strategy = tuned.rerank.strategy.as_str()))
                .await;
            warnings.extend(reranked.warnings);
            chunks = reranked.chunks;
        }
        clock.finish(RetrievalStage::Rerank, t);

        // STITCH
        let t = Instant::now();
        if is_expired(deadline) {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Stitch,
                WarningKind::DeadlineExhausted,
                "request deadline exhausted before neighbor stitching; stitching skipped",
            ));
        } else {
            let stitched = self
                .stitcher
                .stitch(chunks, &acl, &tuned)
                .instrument(tracing::debug_span!("stitch"))
                .await;
            warnings.extend(stitched.warnings);
            chunks = stitched.chunks;
        }
        clock.finish(RetrievalStage::Stitch, t);

        // BUDGET
        let t = Instant::now();
        let assembled = ContextBudgetAssembler::new(tuned.max_context_tokens, tuned.assembly_order).assemble(chunks);
        warnings.extend(assembled.warnings);
        let mut chunks = assembled.chunks;
        clock.finish(RetrievalStage::Budget, t);

        // DONE
        enforce_access(&mut chunks, identity, &acl, &mut warnings);
        if chunks.is_empty() {
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Done,
                WarningKind::EmptyResult,
                "no relevant accessible content was found",
            ));
        }
        let total_tokens = chunks.iter().map(|c| c.token_count).sum();

        let mut result = RetrievalResult {
            request_id,
            chunks,
            rewritten_queries: variants,
            intent,
            acl: acl.summary(),
            total_tokens,
            timings: clock.timings,
            warnings,
        };

        if let Err(e) = self.emit_completed(&result, identity, started).await {
            tracing::warn!(error = %e, "Retrieval audit delivery failed");
            result.warnings.push(RetrievalWarning::new(
                RetrievalStage::Done,
                WarningKind::AuditDelivery,
                format!("retrieval audit record was not delivered: {}", e),
            ));
        }

        tracing::info!(
            intent = intent.as_str(),
            chunks = result.chunks.len(),
            total_tokens = result.total_tokens,
            warnings = result.warnings.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Retrieval complete"
        );

        Ok(result)
    }

    /// Best-effort completion record
    async fn emit_completed(
        &self,
        result: &RetrievalResult,
        identity: &SecurityIdentity,
        started: Instant,
    ) -> Result<()> {
        let event = AuditEvent::RetrievalCompleted(RetrievalAuditRecord {
            event_id: Uuid::new_v4(),
            request_id: result.request_id,
            timestamp: Utc::now(),
            tenant_id: identity.tenant_id().to_string(),
            user_id: identity.user_id().to_string(),
            intent: result.intent.as_str().to_string(),
            chunk_ids: result.chunks.iter().map(|c| c.id.clone()).collect(),
            warning_count: result.warnings.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        self.audit.emit(&event).await
    }
}

/// Last line of defense for tenant isolation and the access predicate
fn enforce_access(
    chunks: &mut Vec<RetrievedChunk>,
    identity: &SecurityIdentity,
    acl: &AclFilterResult,
    warnings: &mut Vec<RetrievalWarning>,
) {
    let before = chunks.len();
    chunks.retain(|c| {
        c.security.tenant_id == identity.tenant_id() && acl.predicate.evaluate(&c.security, &c.attributes)
    });
    let removed = before - chunks.len();
    if removed > 0 {
        tracing::error!(removed, "Chunks outside the access predicate reached the final stage");
        warnings.push(RetrievalWarning::new(
            RetrievalStage::Done,
            WarningKind::AclViolation,
            format!("{} chunk(s) outside the access predicate were removed", removed),
        ));
    }
}

fn is_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn deadline_ms(request: &RetrievalRequest) -> u64 {
    request.deadline.map_or(0, |d| d.as_millis() as u64)
}
