//! Forwarding rules and the table that holds them.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// One named forwarding rule: listen on `local_addr`, forward to `remote_addr`.
///
/// Names are labels only; nothing requires them to be unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub name: String,
    pub local_addr: String,
    pub remote_addr: String,
}

impl ForwardingRule {
    pub fn new(
        name: impl Into<String>,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
        }
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}->{})", self.name, self.local_addr, self.remote_addr)
    }
}

/// Append-only, thread-safe list of rules.
///
/// The lock is held only to push or to clone the list out; callers iterate
/// over the snapshot without it.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: RwLock<Vec<Arc<ForwardingRule>>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Never fails.
    pub fn add(&self, name: &str, local_addr: &str, remote_addr: &str) {
        let rule = Arc::new(ForwardingRule::new(name, local_addr, remote_addr));
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    /// Point-in-time copy of the rules.
    pub fn snapshot(&self) -> Vec<Arc<ForwardingRule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
