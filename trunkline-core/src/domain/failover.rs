//! Failover policies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Name of the policy used when a group's own policy is absent.
pub const GLOBAL_POLICY: &str = "global";

/// Response codes that send the request on to the next candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FailoverPolicy {
    /// Policy name.
    pub name: String,
    /// Codes treated as "try the next candidate".
    pub codes: HashSet<u16>,
    /// Code that carries an explicit Retry-After from the destination.
    pub retry_after: Option<u16>,
}

impl FailoverPolicy {
    /// Create a policy from a list of codes.
    pub fn new(name: impl Into<String>, codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            name: name.into(),
            codes: codes.into_iter().collect(),
            retry_after: None,
        }
    }

    /// Set the retry-after code.
    pub fn with_retry_after(mut self, code: u16) -> Self {
        self.retry_after = Some(code);
        self
    }

    /// Whether a response with this code should fail over.
    pub fn should_failover(&self, code: u16) -> bool {
        self.codes.contains(&code) || self.retry_after == Some(code)
    }
}

/// Lookup table of failover policies keyed by name.
#[derive(Debug, Clone, Default)]
pub struct FailoverPolicies {
    policies: HashMap<String, Arc<FailoverPolicy>>,
    empty: Arc<FailoverPolicy>,
}

impl FailoverPolicies {
    /// Build the table from a list of policies.
    pub fn new(policies: impl IntoIterator<Item = FailoverPolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|p| (p.name.clone(), Arc::new(p)))
                .collect(),
            empty: Arc::new(FailoverPolicy::default()),
        }
    }

    /// Resolve a policy by name, falling back to [`GLOBAL_POLICY`] and then to
    /// a policy that never fails over.
    pub fn resolve(&self, name: &str) -> Arc<FailoverPolicy> {
        self.policies
            .get(name)
            .or_else(|| self.policies.get(GLOBAL_POLICY))
            .cloned()
            .unwrap_or_else(|| self.empty.clone())
    }

    /// Whether a policy with this exact name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_global() {
        let table = FailoverPolicies::new(vec![
            FailoverPolicy::new(GLOBAL_POLICY, [503]),
            FailoverPolicy::new("carrier", [480, 503]),
        ]);

        assert!(table.resolve("carrier").should_failover(480));
        assert!(!table.resolve("missing").should_failover(480));
        assert!(table.resolve("missing").should_failover(503));
    }

    #[test]
    fn empty_table_never_fails_over() {
        let table = FailoverPolicies::default();
        assert!(!table.resolve("anything").should_failover(503));
    }

    #[test]
    fn retry_after_code_fails_over() {
        let policy = FailoverPolicy::new("p", [500]).with_retry_after(503);
        assert!(policy.should_failover(503));
        assert!(policy.should_failover(500));
        assert!(!policy.should_failover(486));
    }
}
