//! Audit sink abstraction
//!
//! ACL decisions are audited on every invocation and a delivery failure
//! aborts the request. Retrieval-completed events are best-effort.

use crate::acl::AclStrategy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keystone_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Record of one ACL predicate construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclAuditRecord {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub user_id: String,
    /// `None` when the predicate could not be constructed
    pub strategy: Option<AclStrategy>,
    pub groups_total: usize,
    pub groups_included: usize,
    pub groups_truncated: usize,
    pub reason: String,
    pub predicate_fingerprint: Option<String>,
}

/// Summary of one completed retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalAuditRecord {
    pub event_id: Uuid,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub user_id: String,
    pub intent: String,
    pub chunk_ids: Vec<String>,
    pub warning_count: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    AclDecision(AclAuditRecord),
    RetrievalCompleted(RetrievalAuditRecord),
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::AclDecision(_) => "acl_decision",
            AuditEvent::RetrievalCompleted(_) => "retrieval_completed",
        }
    }
}

/// Append-only audit destination
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: &AuditEvent) -> Result<()>;
}

/// Writes audit events to the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(target: "audit", kind = event.kind(), event = %payload, "Audit event");
        Ok(())
    }
}

/// POSTs audit events as JSON to an append-only collector
pub struct HttpAuditSink {
    client: reqwest::Client,
    url: String,
}

impl HttpAuditSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| AppError::AuditUnavailable {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(AppError::AuditUnavailable {
                message: format!("Collector returned {}", response.status()),
            });
        }

        Ok(())
    }
}

/// In-memory sink for tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects every event
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn acl_records(&self) -> Vec<AclAuditRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::AclDecision(record) => Some(record),
                AuditEvent::RetrievalCompleted(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::AuditUnavailable {
                message: "memory sink configured to fail".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        Ok(())
    }
}
