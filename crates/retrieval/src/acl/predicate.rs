//! Access predicate expression tree
//!
//! One predicate value is used twice: rendered to an OData-style filter
//! string for the index, and evaluated against each returned row so the
//! core never surfaces a chunk the predicate would exclude.

use crate::model::{ChunkSecurity, Clearance};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Index fields the predicate can reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityField {
    TenantId,
    AllowedUsers,
    AllowedGroups,
    Department,
    /// Caller-supplied attribute filter
    Attribute(String),
}

impl SecurityField {
    /// Name of the field in the index schema
    pub fn index_name(&self) -> &str {
        match self {
            SecurityField::TenantId => "tenant_id",
            SecurityField::AllowedUsers => "allowed_users",
            SecurityField::AllowedGroups => "allowed_groups",
            SecurityField::Department => "department",
            SecurityField::Attribute(name) => name,
        }
    }

    fn is_collection(&self) -> bool {
        matches!(self, SecurityField::AllowedUsers | SecurityField::AllowedGroups)
    }
}

/// Boolean predicate over chunk security metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AccessPredicate {
    And { clauses: Vec<AccessPredicate> },
    Or { clauses: Vec<AccessPredicate> },
    /// Field (or any element of a collection field) equals one of `values`
    AnyOf { field: SecurityField, values: Vec<String> },
    /// Chunk is not soft-deleted or archived
    Active,
    /// Sensitivity exactly equals `level`
    SensitivityIs { level: Clearance },
    /// Sensitivity at or below `level`
    SensitivityAtMost { level: Clearance },
}

impl AccessPredicate {
    pub fn any_of<I, S>(field: SecurityField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessPredicate::AnyOf {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Evaluate against a row's security metadata and attributes
    pub fn evaluate(&self, security: &ChunkSecurity, attributes: &BTreeMap<String, String>) -> bool {
        match self {
            AccessPredicate::And { clauses } => clauses.iter().all(|c| c.evaluate(security, attributes)),
            AccessPredicate::Or { clauses } => clauses.iter().any(|c| c.evaluate(security, attributes)),
            AccessPredicate::AnyOf { field, values } => {
                let contains = |candidate: &str| values.iter().any(|v| v == candidate);
                match field {
                    SecurityField::TenantId => contains(security.tenant_id.as_str()),
                    SecurityField::AllowedUsers => {
                        security.allowed_users.iter().any(|u| contains(u.as_str()))
                    }
                    SecurityField::AllowedGroups => {
                        security.allowed_groups.iter().any(|g| contains(g.as_str()))
                    }
                    SecurityField::Department => security.department.as_deref().is_some_and(contains),
                    SecurityField::Attribute(name) => {
                        attributes.get(name).is_some_and(|value| contains(value.as_str()))
                    }
                }
            }
            AccessPredicate::Active => security.active,
            AccessPredicate::SensitivityIs { level } => security.sensitivity == *level,
            AccessPredicate::SensitivityAtMost { level } => security.sensitivity <= *level,
        }
    }

    /// Render as an OData filter expression
    pub fn render(&self) -> String {
        match self {
            AccessPredicate::And { clauses } => join_clauses(clauses, " and "),
            AccessPredicate::Or { clauses } => join_clauses(clauses, " or "),
            AccessPredicate::AnyOf { field, values } => {
                let name = field.index_name();
                let list = values.iter().map(|v| escape(v)).collect::<Vec<_>>().join(",");
                if field.is_collection() {
                    format!("{}/any(x: search.in(x, '{}', ','))", name, list)
                } else if values.len() == 1 {
                    format!("{} eq '{}'", name, list)
                } else {
                    format!("search.in({}, '{}', ',')", name, list)
                }
            }
            AccessPredicate::Active => "is_active eq true".to_string(),
            AccessPredicate::SensitivityIs { level } => {
                format!("sensitivity_level eq {}", level.level())
            }
            AccessPredicate::SensitivityAtMost { level } => {
                format!("sensitivity_level le {}", level.level())
            }
        }
    }

    /// SHA-256 of the rendered filter, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Number of list-membership clauses (AnyOf over groups)
    pub fn group_clause_count(&self) -> usize {
        match self {
            AccessPredicate::And { clauses } | AccessPredicate::Or { clauses } => {
                clauses.iter().map(|c| c.group_clause_count()).sum()
            }
            AccessPredicate::AnyOf {
                field: SecurityField::AllowedGroups,
                ..
            } => 1,
            _ => 0,
        }
    }

    /// Longest value list carried by any single clause
    pub fn max_list_len(&self) -> usize {
        match self {
            AccessPredicate::And { clauses } | AccessPredicate::Or { clauses } => {
                clauses.iter().map(|c| c.max_list_len()).max().unwrap_or(0)
            }
            AccessPredicate::AnyOf { values, .. } => values.len(),
            _ => 0,
        }
    }
}

fn join_clauses(clauses: &[AccessPredicate], separator: &str) -> String {
    let rendered: Vec<String> = clauses.iter().map(|c| c.render()).collect();
    match rendered.len() {
        0 => String::new(),
        1 => rendered.into_iter().next().unwrap_or_default(),
        _ => format!("({})", rendered.join(separator)),
    }
}

/// OData string literal escaping
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}
