//! Relevance oracle - the external judging model
//!
//! `judge` returns either a validated record or a typed failure. Raw model
//! output is parsed by [`JudgeRecord::parse`]; anything that does not
//! validate is `JudgeError::Malformed`, never a panic or a silent default.

use crate::model::HallucinationRisk;
use async_trait::async_trait;
use keystone_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Which judgment is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeKind {
    /// 0-3 relevance of the passage to the query
    Relevance,
    /// 0-1 explicit-evidence support plus an evidence flag
    Support,
    /// Risk that an answer built on the passage would be unsupported
    HallucinationRisk,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Relevance => "relevance",
            JudgeKind::Support => "support",
            JudgeKind::HallucinationRisk => "hallucination_risk",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            JudgeKind::Relevance => {
                "Rate how relevant the passage is to the query on a scale from 0 (unrelated) \
                 to 3 (directly answers it). Respond with JSON only: {\"relevance\": <number>}"
            }
            JudgeKind::Support => {
                "Rate from 0 to 1 how much explicit evidence the passage contains for answering \
                 the query, and whether it states the answer explicitly. Respond with JSON only: \
                 {\"support\": <number>, \"explicit_evidence\": <true|false>}"
            }
            JudgeKind::HallucinationRisk => {
                "Assess the risk that an answer to the query based only on this passage would \
                 contain unsupported claims. Respond with JSON only: \
                 {\"risk\": \"low\" | \"medium\" | \"high\"}"
            }
        }
    }
}

/// A validated judgment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JudgeRecord {
    Relevance { score: f64 },
    Support { score: f64, explicit_evidence: bool },
    HallucinationRisk { risk: HallucinationRisk },
}

/// Typed oracle failure; never escapes the reranker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JudgeError {
    #[error("oracle unavailable: {0}")]
    Upstream(String),

    #[error("oracle timed out after {0}ms")]
    Timeout(u64),

    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RelevanceBody {
    relevance: f64,
}

#[derive(Deserialize)]
struct SupportBody {
    support: f64,
    #[serde(default)]
    explicit_evidence: bool,
}

#[derive(Deserialize)]
struct RiskBody {
    risk: HallucinationRisk,
}

impl JudgeRecord {
    /// Parse and validate raw model output for `kind`.
    ///
    /// Models often wrap JSON in prose or code fences, so the outermost
    /// `{...}` span is extracted first.
    pub fn parse(kind: JudgeKind, raw: &str) -> std::result::Result<Self, JudgeError> {
        let start = raw.find('{');
        let end = raw.rfind('}');
        let json = match (start, end) {
            (Some(s), Some(e)) if s < e => &raw[s..=e],
            _ => return Err(JudgeError::Malformed("no JSON object in response".to_string())),
        };
        let malformed = |e: serde_json::Error| JudgeError::Malformed(e.to_string());

        match kind {
            JudgeKind::Relevance => {
                let body: RelevanceBody = serde_json::from_str(json).map_err(malformed)?;
                if !(0.0..=3.0).contains(&body.relevance) {
                    return Err(JudgeError::Malformed(format!(
                        "relevance {} outside [0, 3]",
                        body.relevance
                    )));
                }
                Ok(JudgeRecord::Relevance {
                    score: body.relevance,
                })
            }
            JudgeKind::Support => {
                let body: SupportBody = serde_json::from_str(json).map_err(malformed)?;
                if !(0.0..=1.0).contains(&body.support) {
                    return Err(JudgeError::Malformed(format!(
                        "support {} outside [0, 1]",
                        body.support
                    )));
                }
                Ok(JudgeRecord::Support {
                    score: body.support,
                    explicit_evidence: body.explicit_evidence,
                })
            }
            JudgeKind::HallucinationRisk => {
                let body: RiskBody = serde_json::from_str(json).map_err(malformed)?;
                Ok(JudgeRecord::HallucinationRisk { risk: body.risk })
            }
        }
    }

    pub fn kind(&self) -> JudgeKind {
        match self {
            JudgeRecord::Relevance { .. } => JudgeKind::Relevance,
            JudgeRecord::Support { .. } => JudgeKind::Support,
            JudgeRecord::HallucinationRisk { .. } => JudgeKind::HallucinationRisk,
        }
    }
}

/// External (query, passage) judge
#[async_trait]
pub trait RelevanceOracle: Send + Sync {
    async fn judge(
        &self,
        kind: JudgeKind,
        query: &str,
        passage: &str,
    ) -> std::result::Result<JudgeRecord, JudgeError>;

    fn name(&self) -> &str;
}

/// Chat-completions judge
pub struct HttpRelevanceOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl HttpRelevanceOracle {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.into(),
            timeout,
        })
    }

    fn build_prompt(kind: JudgeKind, query: &str, passage: &str) -> String {
        format!(
            "{}\n\nQuery: {}\n\nPassage:\n{}\n",
            kind.instruction(),
            query,
            passage
        )
    }
}

#[async_trait]
impl RelevanceOracle for HttpRelevanceOracle {
    async fn judge(
        &self,
        kind: JudgeKind,
        query: &str,
        passage: &str,
    ) -> std::result::Result<JudgeRecord, JudgeError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You are a strict relevance judge for an enterprise search system. \
                              Judge only from the passage text."
                        .to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: Self::build_prompt(kind, query, passage),
                },
            ],
            max_tokens: 64,
            temperature: 0.0,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                JudgeError::Timeout(self.timeout.as_millis() as u64)
            } else {
                JudgeError::Upstream(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(JudgeError::Upstream(format!("API error {}: {}", status, body)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| JudgeError::Malformed(format!("Failed to parse response: {}", e)))?;

        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| JudgeError::Malformed("Empty response from oracle".to_string()))?;

        JudgeRecord::parse(kind, content)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Deterministic judge for tests, scored by query-term coverage
#[derive(Debug, Default)]
pub struct MockRelevanceOracle {
    failing: HashSet<JudgeKind>,
    malformed: HashSet<JudgeKind>,
    failing_passages: Vec<String>,
    hanging: bool,
    calls: AtomicUsize,
}

impl MockRelevanceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every judgment of `kind` fails upstream
    pub fn failing_on(mut self, kind: JudgeKind) -> Self {
        self.failing.insert(kind);
        self
    }

    /// Every judgment of `kind` returns unparseable output
    pub fn malformed_on(mut self, kind: JudgeKind) -> Self {
        self.malformed.insert(kind);
        self
    }

    /// Judgments for passages containing `needle` fail upstream
    pub fn failing_for_passage(mut self, needle: impl Into<String>) -> Self {
        self.failing_passages.push(needle.into());
        self
    }

    /// Never answer
    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Share of distinct query terms present in the passage
    fn coverage(query: &str, passage: &str) -> f64 {
        let terms = |text: &str| -> HashSet<String> {
            text.split(|c: char| !c.is_alphanumeric())
                .filter(|t| t.len() > 2)
                .map(|t| t.to_lowercase())
                .collect()
        };
        let q = terms(query);
        if q.is_empty() {
            return 0.0;
        }
        let p = terms(passage);
        q.intersection(&p).count() as f64 / q.len() as f64
    }

    fn respond(kind: JudgeKind, coverage: f64) -> String {
        match kind {
            JudgeKind::Relevance => format!("{{\"relevance\": {:.3}}}", coverage * 3.0),
            JudgeKind::Support => format!(
                "{{\"support\": {:.3}, \"explicit_evidence\": {}}}",
                coverage,
                coverage >= 0.75
            ),
            JudgeKind::HallucinationRisk => {
                let risk = if coverage >= 0.5 {
                    "low"
                } else if coverage > 0.0 {
                    "medium"
                } else {
                    "high"
                };
                format!("{{\"risk\": \"{}\"}}", risk)
            }
        }
    }
}

#[async_trait]
impl RelevanceOracle for MockRelevanceOracle {
    async fn judge(
        &self,
        kind: JudgeKind,
        query: &str,
        passage: &str,
    ) -> std::result::Result<JudgeRecord, JudgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.hanging {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(&kind) || self.failing_passages.iter().any(|n| passage.contains(n.as_str())) {
            return Err(JudgeError::Upstream("injected failure".to_string()));
        }
        if self.malformed.contains(&kind) {
            return JudgeRecord::parse(kind, "I think this passage is quite relevant.");
        }

        JudgeRecord::parse(kind, &Self::respond(kind, Self::coverage(query, passage)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
