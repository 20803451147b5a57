//! Group selection for the fallback ACL strategy
//!
//! When an identity carries more groups than the index can express, only a
//! bounded subset makes it into the predicate. Which subset is a product
//! decision, so it sits behind a trait.

use crate::model::SecurityIdentity;
use std::collections::HashSet;

/// Chooses which groups survive fallback truncation
pub trait GroupSelectionPolicy: Send + Sync {
    /// Return at most `limit` groups, all drawn from `identity.groups()`
    fn select(&self, identity: &SecurityIdentity, limit: usize) -> Vec<String>;

    /// Short name recorded in audit reasons
    fn name(&self) -> &'static str;
}

/// Keep the first `limit` groups in the order the resolver returned them
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredOrder;

impl GroupSelectionPolicy for DeclaredOrder {
    fn select(&self, identity: &SecurityIdentity, limit: usize) -> Vec<String> {
        identity.groups().iter().take(limit).cloned().collect()
    }

    fn name(&self) -> &'static str {
        "declared_order"
    }
}

/// Priority groups first (in the identity's order), then the rest in declared order
#[derive(Debug, Default, Clone)]
pub struct PinnedFirst {
    pinned: HashSet<String>,
}

impl PinnedFirst {
    pub fn new<I, S>(pinned: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pinned: pinned.into_iter().map(Into::into).collect(),
        }
    }
}

impl GroupSelectionPolicy for PinnedFirst {
    fn select(&self, identity: &SecurityIdentity, limit: usize) -> Vec<String> {
        let (pinned, rest): (Vec<&String>, Vec<&String>) = identity
            .groups()
            .iter()
            .partition(|g| self.pinned.contains(g.as_str()));

        pinned
            .into_iter()
            .chain(rest)
            .take(limit)
            .cloned()
            .collect()
    }

    fn name(&self) -> &'static str {
        "pinned_first"
    }
}
