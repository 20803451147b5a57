//! Deterministic in-memory index for tests and local runs
//!
//! Vector scores are set-cosine term overlap, lexical scores are summed
//! term frequencies, so the two modalities rank the same corpus differently.

use super::{IndexRow, Modality, PredicateCapacity, SearchIndex};
use crate::acl::AccessPredicate;
use keystone_common::errors::{AppError, Result};
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory search index with failure injection
#[derive(Debug, Default)]
pub struct MockSearchIndex {
    rows: Vec<IndexRow>,
    capacity: Option<usize>,
    failing: HashSet<(Modality, String)>,
    hanging: HashSet<(Modality, String)>,
    fail_all: bool,
    ignore_predicate: bool,
    calls: AtomicUsize,
}

impl MockSearchIndex {
    pub fn new(rows: Vec<IndexRow>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Declare a list-size limit for membership clauses
    pub fn with_capacity(mut self, limit: usize) -> Self {
        self.capacity = Some(limit);
        self
    }

    /// Fail the call for this exact (modality, query)
    pub fn failing_on(mut self, modality: Modality, query: impl Into<String>) -> Self {
        self.failing.insert((modality, query.into()));
        self
    }

    /// Never answer the call for this exact (modality, query)
    pub fn hanging_on(mut self, modality: Modality, query: impl Into<String>) -> Self {
        self.hanging.insert((modality, query.into()));
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    /// Return rows regardless of the predicate, like a misconfigured index
    pub fn ignoring_predicate(mut self) -> Self {
        self.ignore_predicate = true;
        self
    }

    /// Number of `search` calls received
    pub fn search_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn visible<'a>(&'a self, predicate: &'a AccessPredicate) -> impl Iterator<Item = &'a IndexRow> + 'a {
        self.rows
            .iter()
            .filter(move |row| self.ignore_predicate || predicate.evaluate(&row.security, &row.attributes))
    }
}

#[async_trait::async_trait]
impl SearchIndex for MockSearchIndex {
    async fn search(
        &self,
        modality: Modality,
        query: &str,
        predicate: &AccessPredicate,
        top_k: usize,
    ) -> Result<Vec<IndexRow>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (modality, query.to_string());

        if self.hanging.contains(&key) {
            std::future::pending::<()>().await;
        }
        if self.fail_all || self.failing.contains(&key) {
            return Err(AppError::upstream(
                "search_index",
                format!("injected {} failure", modality.as_str()),
            ));
        }

        let terms = tokenize(query);
        let mut scored: Vec<IndexRow> = self
            .visible(predicate)
            .filter_map(|row| {
                let score = match modality {
                    Modality::Vector => cosine_overlap(&terms, &row.content),
                    Modality::Lexical => term_frequency(&terms, &row.content),
                };
                (score > 0.0).then(|| IndexRow {
                    score,
                    ..row.clone()
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn neighbors(
        &self,
        document_id: &str,
        section_path: &[String],
        orders: RangeInclusive<u32>,
        predicate: &AccessPredicate,
    ) -> Result<Vec<IndexRow>> {
        if self.fail_all {
            return Err(AppError::upstream("search_index", "injected neighbor failure"));
        }

        let mut rows: Vec<IndexRow> = self
            .visible(predicate)
            .filter(|row| {
                row.document_id == document_id
                    && row.section_path == section_path
                    && orders.contains(&row.reading_order)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.reading_order);
        Ok(rows)
    }

    fn predicate_capacity(&self) -> PredicateCapacity {
        match self.capacity {
            Some(limit) => PredicateCapacity::Limited(limit),
            None => PredicateCapacity::Unlimited,
        }
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn cosine_overlap(terms: &[String], content: &str) -> f64 {
    let query: HashSet<&str> = terms.iter().map(String::as_str).collect();
    let doc_terms = tokenize(content);
    let doc: HashSet<&str> = doc_terms.iter().map(String::as_str).collect();
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(&doc).count() as f64;
    shared / ((query.len() * doc.len()) as f64).sqrt()
}

fn term_frequency(terms: &[String], content: &str) -> f64 {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(content) {
        *counts.entry(token).or_default() += 1;
    }
    let unique: HashSet<&String> = terms.iter().collect();
    unique
        .into_iter()
        .map(|t| counts.get(t).copied().unwrap_or(0) as f64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::SecurityField;
    use crate::model::{ChunkSecurity, Clearance, ContentType};

    fn row(id: &str, order: u32, content: &str) -> IndexRow {
        IndexRow {
            id: id.into(),
            document_id: "handbook".into(),
            content: content.into(),
            score: 0.0,
            content_type: ContentType::Text,
            section_path: vec!["Leave".into()],
            reading_order: order,
            page_range: None,
            token_count: None,
            updated_at: None,
            semantic_score: None,
            security: ChunkSecurity {
                tenant_id: "acme".into(),
                active: true,
                sensitivity: Clearance::Public,
                allowed_users: vec![],
                allowed_groups: vec![],
                department: None,
            },
            attributes: Default::default(),
        }
    }

    fn tenant(t: &str) -> AccessPredicate {
        AccessPredicate::any_of(SecurityField::TenantId, [t])
    }

    #[tokio::test]
    async fn test_modalities_rank_differently() {
        let index = MockSearchIndex::new(vec![
            row("a", 1, "leave leave leave policy overview and other long words here"),
            row("b", 2, "leave policy"),
        ]);

        let vector = index.search(Modality::Vector, "leave policy", &tenant("acme"), 10).await.unwrap();
        let lexical = index.search(Modality::Lexical, "leave policy", &tenant("acme"), 10).await.unwrap();

        assert_eq!(vector[0].id, "b");
        assert_eq!(lexical[0].id, "a");
        assert_eq!(index.search_calls(), 2);
    }

    #[tokio::test]
    async fn test_predicate_scopes_rows() {
        let index = MockSearchIndex::new(vec![row("a", 1, "leave policy")]);
        let rows = index.search(Modality::Lexical, "leave", &tenant("globex"), 10).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_neighbors_in_reading_order() {
        let index = MockSearchIndex::new(vec![
            row("c3", 3, "three"),
            row("c1", 1, "one"),
            row("c2", 2, "two"),
            row("c9", 9, "nine"),
        ]);
        let rows = index
            .neighbors("handbook", &["Leave".to_string()], 1..=3, &tenant("acme"))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }
}
