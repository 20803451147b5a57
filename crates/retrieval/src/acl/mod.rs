//! ACL filter construction
//!
//! Turns a security identity into a bounded-size access predicate:
//! - tenant isolation and active-content clauses are always present
//! - access is granted by public classification, direct user grant,
//!   group grant, or department grant
//! - clearance caps the sensitivity level
//!
//! Group lists are bounded by the smaller of the configured maximum `M` and
//! the index's declared capacity. With `g` groups:
//! - `g <= M`       direct   (one list clause)
//! - `M < g <= 3M`  chunked  (several OR-ed list clauses, each `<= M`)
//! - `g > 3M`       fallback (`M` groups chosen by policy, the rest truncated)

mod policy;
mod predicate;

pub use policy::{DeclaredOrder, GroupSelectionPolicy, PinnedFirst};
pub use predicate::{AccessPredicate, SecurityField};

use crate::audit::{AclAuditRecord, AuditEvent, AuditSink};
use crate::model::{
    AclSummary, Clearance, FieldFilter, RetrievalStage, RetrievalWarning, SecurityIdentity,
    WarningKind,
};
use crate::search::PredicateCapacity;
use chrono::Utc;
use keystone_common::errors::{AppError, Result};
use keystone_common::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Chunked strategy covers up to this many multiples of `M`
const CHUNKED_FACTOR: usize = 3;

/// Fields callers may not filter on directly
const RESERVED_FIELDS: &[&str] = &[
    "tenant_id",
    "is_active",
    "sensitivity_level",
    "allowed_users",
    "allowed_groups",
    "department",
];

/// Delimiter used by `search.in`; may not appear inside listed values
const LIST_DELIMITER: char = ',';

/// How the group list was expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclStrategy {
    Direct,
    Chunked,
    Fallback,
}

impl AclStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AclStrategy::Direct => "direct",
            AclStrategy::Chunked => "chunked",
            AclStrategy::Fallback => "fallback",
        }
    }
}

/// Output of ACL construction
#[derive(Debug, Clone, PartialEq)]
pub struct AclFilterResult {
    pub predicate: AccessPredicate,
    /// Rendered filter sent to the index
    pub filter: String,
    pub strategy: AclStrategy,
    pub groups_total: usize,
    pub groups_included: usize,
    pub groups_truncated: usize,
    pub reason: String,
    pub fingerprint: String,
    pub warnings: Vec<RetrievalWarning>,
}

impl AclFilterResult {
    pub fn summary(&self) -> AclSummary {
        AclSummary {
            strategy: self.strategy,
            groups_included: self.groups_included,
            groups_truncated: self.groups_truncated,
            predicate_fingerprint: self.fingerprint.clone(),
        }
    }

    /// Whether a row with this metadata satisfies the predicate
    pub fn permits(&self, row: &crate::search::IndexRow) -> bool {
        self.predicate.evaluate(&row.security, &row.attributes)
    }
}

/// Builds access predicates and audits every decision
pub struct AclFilterBuilder {
    max_group_list: usize,
    policy: Arc<dyn GroupSelectionPolicy>,
    audit: Arc<dyn AuditSink>,
}

impl AclFilterBuilder {
    /// `configured_max` is `M`; a declared index capacity may lower it further
    pub fn new(configured_max: usize, capacity: PredicateCapacity, audit: Arc<dyn AuditSink>) -> Self {
        let max_group_list = match capacity {
            PredicateCapacity::Unlimited => configured_max,
            PredicateCapacity::Limited(limit) => configured_max.min(limit),
        }
        .max(1);

        Self {
            max_group_list,
            policy: Arc::new(DeclaredOrder),
            audit,
        }
    }

    /// Replace the fallback group-selection policy
    pub fn with_policy(mut self, policy: Arc<dyn GroupSelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Effective `M`
    pub fn effective_limit(&self) -> usize {
        self.max_group_list
    }

    /// Build the predicate and emit the mandatory audit record
    pub async fn build(
        &self,
        identity: &SecurityIdentity,
        filters: &[FieldFilter],
    ) -> Result<AclFilterResult> {
        let planned = self.plan(identity, filters);

        let record = match &planned {
            Ok(result) => AclAuditRecord {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                tenant_id: identity.tenant_id().to_string(),
                user_id: identity.user_id().to_string(),
                strategy: Some(result.strategy),
                groups_total: result.groups_total,
                groups_included: result.groups_included,
                groups_truncated: result.groups_truncated,
                reason: result.reason.clone(),
                predicate_fingerprint: Some(result.fingerprint.clone()),
            },
            Err(e) => AclAuditRecord {
                event_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                tenant_id: identity.tenant_id().to_string(),
                user_id: identity.user_id().to_string(),
                strategy: None,
                groups_total: identity.groups().len(),
                groups_included: 0,
                groups_truncated: 0,
                reason: e.to_string(),
                predicate_fingerprint: None,
            },
        };

        if let Err(e) = self.audit.emit(&AuditEvent::AclDecision(record)).await {
            tracing::error!(
                tenant_id = %identity.tenant_id(),
                error = %e,
                "ACL audit emission failed"
            );
            return Err(match e {
                AppError::AuditUnavailable { .. } => e,
                other => AppError::AuditUnavailable {
                    message: other.to_string(),
                },
            });
        }

        let result = planned?;
        metrics::record_acl_strategy(result.strategy.as_str(), result.groups_truncated);

        if result.strategy == AclStrategy::Fallback {
            tracing::warn!(
                tenant_id = %identity.tenant_id(),
                groups_total = result.groups_total,
                groups_included = result.groups_included,
                groups_truncated = result.groups_truncated,
                policy = self.policy.name(),
                "ACL group list truncated"
            );
        } else {
            tracing::debug!(
                tenant_id = %identity.tenant_id(),
                strategy = result.strategy.as_str(),
                groups_included = result.groups_included,
                "ACL predicate built"
            );
        }

        Ok(result)
    }

    /// Pure predicate construction, no audit
    pub fn plan(&self, identity: &SecurityIdentity, filters: &[FieldFilter]) -> Result<AclFilterResult> {
        validate_identity(identity)?;

        let groups = identity.groups();
        let g = groups.len();
        let mut warnings = Vec::new();

        let m = self.max_group_list;
        let (strategy, group_clauses, included, reason) = if g <= m {
            (
                AclStrategy::Direct,
                single_clause(groups),
                g,
                format!("{} groups fit in one list clause (limit {})", g, m),
            )
        } else if g <= m.saturating_mul(CHUNKED_FACTOR) {
            let clauses: Vec<AccessPredicate> = groups
                .chunks(m)
                .map(|chunk| AccessPredicate::any_of(SecurityField::AllowedGroups, chunk.iter().cloned()))
                .collect();
            let reason = format!(
                "{} groups split into {} list clauses of at most {}",
                g,
                clauses.len(),
                m
            );
            (AclStrategy::Chunked, clauses, g, reason)
        } else {
            let selected = sanitize_selection(self.policy.select(identity, m), groups, m);
            let included = selected.len();
            let reason = format!(
                "{} groups exceed {} (3 x {}); kept {} selected by {}",
                g,
                m.saturating_mul(CHUNKED_FACTOR),
                m,
                included,
                self.policy.name()
            );
            warnings.push(RetrievalWarning::new(
                RetrievalStage::BuildAcl,
                WarningKind::AclTruncated,
                format!(
                    "identity has {} groups; only {} were included in the access filter, {} truncated",
                    g,
                    included,
                    g - included
                ),
            ));
            (AclStrategy::Fallback, single_clause(&selected), included, reason)
        };

        let mut grants = vec![
            AccessPredicate::SensitivityIs {
                level: Clearance::Public,
            },
            AccessPredicate::any_of(SecurityField::AllowedUsers, [identity.user_id()]),
        ];
        grants.extend(group_clauses);
        if let Some(department) = identity.department() {
            grants.push(AccessPredicate::any_of(SecurityField::Department, [department]));
        }

        let mut clauses = vec![
            AccessPredicate::any_of(SecurityField::TenantId, [identity.tenant_id()]),
            AccessPredicate::Active,
        ];
        if identity.clearance() < Clearance::MAX {
            clauses.push(AccessPredicate::SensitivityAtMost {
                level: identity.clearance(),
            });
        }
        clauses.push(AccessPredicate::Or { clauses: grants });
        for filter in filters {
            clauses.push(filter_clause(filter)?);
        }

        let predicate = AccessPredicate::And { clauses };
        let filter = predicate.render();
        let fingerprint = predicate.fingerprint();

        Ok(AclFilterResult {
            predicate,
            filter,
            strategy,
            groups_total: g,
            groups_included: included,
            groups_truncated: if strategy == AclStrategy::Fallback { g - included } else { 0 },
            reason,
            fingerprint,
            warnings,
        })
    }
}

/// Keep only groups the identity holds, once each, at most `m`, topped up
/// from declared order when the policy returns fewer
fn sanitize_selection(selected: Vec<String>, groups: &[String], m: usize) -> Vec<String> {
    let held: HashSet<&str> = groups.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut kept: Vec<String> = Vec::with_capacity(m);

    for group in selected {
        if kept.len() == m {
            break;
        }
        if !held.contains(group.as_str()) {
            tracing::warn!(group = %group, "Group selection policy returned a group the identity does not hold");
            continue;
        }
        if seen.insert(group.clone()) {
            kept.push(group);
        }
    }

    for group in groups {
        if kept.len() == m {
            break;
        }
        if seen.insert(group.clone()) {
            kept.push(group.clone());
        }
    }

    kept
}

fn single_clause(groups: &[String]) -> Vec<AccessPredicate> {
    if groups.is_empty() {
        Vec::new()
    } else {
        vec![AccessPredicate::any_of(SecurityField::AllowedGroups, groups.iter().cloned())]
    }
}

fn reject(message: impl Into<String>) -> AppError {
    AppError::AccessPredicate {
        message: message.into(),
    }
}

fn validate_identity(identity: &SecurityIdentity) -> Result<()> {
    if identity.tenant_id().trim().is_empty() {
        return Err(reject("identity has no tenant id"));
    }
    if identity.user_id().trim().is_empty() {
        return Err(reject("identity has no user id"));
    }
    if identity.user_id().contains(LIST_DELIMITER) {
        return Err(reject("user id contains the list delimiter"));
    }
    if let Some(group) = identity.groups().iter().find(|g| g.contains(LIST_DELIMITER)) {
        return Err(reject(format!("group id '{}' contains the list delimiter", group)));
    }
    Ok(())
}

fn filter_clause(filter: &FieldFilter) -> Result<AccessPredicate> {
    let field = filter.field.trim();
    let valid_name = field
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_name {
        return Err(reject(format!("invalid filter field '{}'", filter.field)));
    }
    if RESERVED_FIELDS.contains(&field) {
        return Err(reject(format!("filter may not override security field '{}'", field)));
    }
    if filter.values.is_empty() {
        return Err(reject(format!("filter on '{}' has no values", field)));
    }
    if filter.values.iter().any(|v| v.contains(LIST_DELIMITER)) {
        return Err(reject(format!("filter on '{}' has a value containing the list delimiter", field)));
    }

    Ok(AccessPredicate::any_of(
        SecurityField::Attribute(field.to_string()),
        filter.values.iter().cloned(),
    ))
}
