//! Concurrent vector + lexical fan-out over query variants
//!
//! Every variant is searched once per modality. Calls run under a
//! concurrency cap and a per-call timeout; a failed call contributes no
//! candidates and a warning. Only when every call fails does the stage fail.

use super::{IndexRow, Modality, RankedHit, RankedList, SearchIndex, SearchOutcome};
use crate::acl::AclFilterResult;
use crate::config::RetrievalConfig;
use crate::model::{RetrievalStage, RetrievalWarning, WarningKind};
use futures::stream::{self, StreamExt};
use keystone_common::errors::{AppError, Result};
use keystone_common::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of one (variant, modality) call
enum CallOutcome {
    Rows(Vec<IndexRow>),
    Failed(String),
    TimedOut(Duration),
}

/// Fans search calls out against one index
pub struct SearchExecutor {
    index: Arc<dyn SearchIndex>,
}

impl SearchExecutor {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    /// Run `variants x {vector, lexical}` searches scoped by `acl`.
    ///
    /// `deadline` clamps every per-call timeout to the time remaining.
    pub async fn execute(
        &self,
        variants: &[String],
        acl: &AclFilterResult,
        config: &RetrievalConfig,
        deadline: Option<Instant>,
    ) -> Result<SearchOutcome> {
        let calls: Vec<(usize, Modality)> = (0..variants.len())
            .flat_map(|i| [(i, Modality::Vector), (i, Modality::Lexical)])
            .collect();
        let attempted = calls.len();

        let results: Vec<(usize, Modality, CallOutcome)> = stream::iter(calls)
            .map(|(variant_index, modality)| {
                let query = variants[variant_index].as_str();
                let top_k = match modality {
                    Modality::Vector => config.vector_k,
                    Modality::Lexical => config.lexical_top,
                };
                async move {
                    let outcome = self
                        .call(modality, query, acl, top_k, config.search_timeout(), deadline)
                        .await;
                    (variant_index, modality, outcome)
                }
            })
            .buffer_unordered(config.search_concurrency)
            .collect()
            .await;

        let mut outcome = SearchOutcome {
            calls_attempted: attempted,
            ..SearchOutcome::default()
        };
        let mut last_error = String::new();

        for (variant_index, modality, call) in results {
            match call {
                CallOutcome::Rows(rows) => {
                    metrics::record_search_call(modality.as_str(), true);
                    let list = self.rank_permitted(variant_index, modality, rows, acl, &mut outcome.warnings);
                    outcome.lists.push(list);
                }
                CallOutcome::Failed(message) => {
                    metrics::record_search_call(modality.as_str(), false);
                    tracing::warn!(
                        index = self.index.name(),
                        variant = variant_index,
                        modality = modality.as_str(),
                        error = %message,
                        "Search call failed"
                    );
                    outcome.calls_failed += 1;
                    outcome.warnings.push(RetrievalWarning::new(
                        RetrievalStage::Search,
                        WarningKind::SearchCallFailed,
                        format!(
                            "{} search for variant {} failed: {}",
                            modality.as_str(),
                            variant_index,
                            message
                        ),
                    ));
                    last_error = message;
                }
                CallOutcome::TimedOut(limit) => {
                    metrics::record_search_call(modality.as_str(), false);
                    tracing::warn!(
                        index = self.index.name(),
                        variant = variant_index,
                        modality = modality.as_str(),
                        timeout_ms = limit.as_millis() as u64,
                        "Search call timed out"
                    );
                    outcome.calls_failed += 1;
                    outcome.warnings.push(RetrievalWarning::new(
                        RetrievalStage::Search,
                        WarningKind::SearchTimeout,
                        format!(
                            "{} search for variant {} timed out after {}ms",
                            modality.as_str(),
                            variant_index,
                            limit.as_millis()
                        ),
                    ));
                    last_error = format!("timed out after {}ms", limit.as_millis());
                }
            }
        }

        if attempted == 0 || outcome.calls_failed == attempted {
            return Err(AppError::RetrievalFailed {
                attempted,
                message: if last_error.is_empty() {
                    "no search calls were issued".to_string()
                } else {
                    last_error
                },
            });
        }

        // Completion order is nondeterministic
        outcome
            .lists
            .sort_by(|a, b| (a.variant_index, a.modality).cmp(&(b.variant_index, b.modality)));

        tracing::debug!(
            lists = outcome.lists.len(),
            failed = outcome.calls_failed,
            candidates = outcome.candidate_count(),
            "Search fan-out complete"
        );

        Ok(outcome)
    }

    async fn call(
        &self,
        modality: Modality,
        query: &str,
        acl: &AclFilterResult,
        top_k: usize,
        per_call: Duration,
        deadline: Option<Instant>,
    ) -> CallOutcome {
        let limit = match deadline {
            Some(deadline) => per_call.min(deadline.saturating_duration_since(Instant::now())),
            None => per_call,
        };
        if limit.is_zero() {
            return CallOutcome::TimedOut(limit);
        }

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            limit,
            self.index.search(modality, query, &acl.predicate, top_k),
        )
        .await;

        match result {
            Ok(Ok(rows)) => {
                tracing::debug!(
                    modality = modality.as_str(),
                    rows = rows.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Search call complete"
                );
                CallOutcome::Rows(rows)
            }
            Ok(Err(e)) => CallOutcome::Failed(e.to_string()),
            Err(_) => CallOutcome::TimedOut(limit),
        }
    }

    /// Drop rows the predicate excludes; ranks keep the index's numbering
    fn rank_permitted(
        &self,
        variant_index: usize,
        modality: Modality,
        rows: Vec<IndexRow>,
        acl: &AclFilterResult,
        warnings: &mut Vec<RetrievalWarning>,
    ) -> RankedList {
        let mut rejected = 0usize;
        let hits = rows
            .into_iter()
            .enumerate()
            .filter_map(|(i, row)| {
                if acl.permits(&row) {
                    Some(RankedHit { rank: i + 1, row })
                } else {
                    rejected += 1;
                    None
                }
            })
            .collect();

        if rejected > 0 {
            tracing::warn!(
                index = self.index.name(),
                modality = modality.as_str(),
                rejected,
                "Index returned rows outside the access predicate"
            );
            warnings.push(RetrievalWarning::new(
                RetrievalStage::Search,
                WarningKind::AclViolation,
                format!(
                    "{} {} row(s) for variant {} were outside the access predicate and were dropped",
                    rejected,
                    modality.as_str(),
                    variant_index
                ),
            ));
        }

        RankedList {
            variant_index,
            modality,
            hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclFilterBuilder;
    use crate::audit::MemoryAuditSink;
    use crate::model::{ChunkSecurity, Clearance, ContentType, SecurityIdentity};
    use crate::search::MockSearchIndex;
    use keystone_common::config::RetrievalParams;

    fn row(id: &str, tenant: &str, content: &str) -> IndexRow {
        IndexRow {
            id: id.into(),
            document_id: "doc-1".into(),
            content: content.into(),
            score: 0.0,
            content_type: ContentType::Text,
            section_path: vec!["Policies".into()],
            reading_order: 1,
            page_range: None,
            token_count: None,
            updated_at: None,
            semantic_score: None,
            security: ChunkSecurity {
                tenant_id: tenant.into(),
                active: true,
                sensitivity: Clearance::Public,
                allowed_users: vec![],
                allowed_groups: vec![],
                department: None,
            },
            attributes: Default::default(),
        }
    }

    fn acl() -> AclFilterResult {
        let identity = SecurityIdentity::new("alice", "acme", ["eng"], Clearance::Internal);
        AclFilterBuilder::new(128, crate::search::PredicateCapacity::Unlimited, Arc::new(MemoryAuditSink::new()))
            .plan(&identity, &[])
            .unwrap()
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig::new(RetrievalParams::recommended()).unwrap()
    }

    fn variants() -> Vec<String> {
        vec!["retention policy".to_string(), "retention".to_string()]
    }

    #[tokio::test]
    async fn test_fan_out_covers_every_variant_and_modality() {
        let index = MockSearchIndex::new(vec![
            row("c1", "acme", "data retention policy"),
            row("c2", "acme", "travel policy"),
        ]);
        let executor = SearchExecutor::new(Arc::new(index));

        let outcome = executor.execute(&variants(), &acl(), &config(), None).await.unwrap();

        assert_eq!(outcome.calls_attempted, 4);
        assert_eq!(outcome.calls_failed, 0);
        let keys: Vec<_> = outcome.lists.iter().map(|l| (l.variant_index, l.modality)).collect();
        assert_eq!(
            keys,
            vec![
                (0, Modality::Vector),
                (0, Modality::Lexical),
                (1, Modality::Vector),
                (1, Modality::Lexical),
            ]
        );
        assert_eq!(outcome.lists[0].hits[0].rank, 1);
    }

    #[tokio::test]
    async fn test_single_failure_is_a_warning() {
        let index = MockSearchIndex::new(vec![row("c1", "acme", "data retention policy")])
            .failing_on(Modality::Lexical, "retention");
        let executor = SearchExecutor::new(Arc::new(index));

        let outcome = executor.execute(&variants(), &acl(), &config(), None).await.unwrap();

        assert_eq!(outcome.calls_failed, 1);
        assert_eq!(outcome.lists.len(), 3);
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::SearchCallFailed));
    }

    #[tokio::test]
    async fn test_every_call_failing_is_fatal() {
        let index = MockSearchIndex::new(vec![row("c1", "acme", "retention")]).failing_all();
        let executor = SearchExecutor::new(Arc::new(index));

        let err = executor.execute(&variants(), &acl(), &config(), None).await.unwrap_err();
        assert!(matches!(err, AppError::RetrievalFailed { attempted: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_times_out() {
        let index = MockSearchIndex::new(vec![row("c1", "acme", "retention")])
            .hanging_on(Modality::Vector, "retention");
        let executor = SearchExecutor::new(Arc::new(index));

        let outcome = executor.execute(&variants(), &acl(), &config(), None).await.unwrap();
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::SearchTimeout));
        assert_eq!(outcome.calls_failed, 1);
    }

    #[tokio::test]
    async fn test_rows_outside_predicate_are_dropped() {
        let index = MockSearchIndex::new(vec![
            row("mine", "acme", "retention policy"),
            row("theirs", "globex", "retention policy"),
        ])
        .ignoring_predicate();
        let executor = SearchExecutor::new(Arc::new(index));

        let outcome = executor.execute(&variants(), &acl(), &config(), None).await.unwrap();

        for list in &outcome.lists {
            assert!(list.hits.iter().all(|h| h.row.security.tenant_id == "acme"));
        }
        assert!(outcome.warnings.iter().any(|w| w.kind == WarningKind::AclViolation));
    }
}
