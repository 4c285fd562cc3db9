//! Routing module holding the active configuration snapshot.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::failover::{FailoverPolicies, FailoverPolicy};
use crate::domain::server_group::ServerGroup;
use crate::domain::trunk::TrunkConfig;
use crate::error::{Error, Result};

/// One consistent view of every server group, failover policy and trunk.
///
/// A snapshot is never mutated after construction; reconfiguration builds a
/// new one and swaps it into the [`RoutingTable`].
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    server_groups: HashMap<String, Arc<ServerGroup>>,
    failover: FailoverPolicies,
    trunks: Vec<Arc<TrunkConfig>>,
}

impl RoutingConfig {
    /// Build a snapshot, checking that names are unique and that every trunk
    /// only references known server groups.
    pub fn new(
        server_groups: Vec<ServerGroup>,
        failover: FailoverPolicies,
        trunks: Vec<TrunkConfig>,
    ) -> Result<Self> {
        let mut groups = HashMap::with_capacity(server_groups.len());
        for group in server_groups {
            let name = group.name.clone();
            if groups.insert(name.clone(), Arc::new(group)).is_some() {
                return Err(Error::config(format!("duplicate server group '{name}'")));
            }
        }

        let mut seen = HashMap::new();
        for trunk in &trunks {
            if let Some(previous) = seen.insert((trunk.kind, trunk.lookup_key().to_string()), &trunk.name) {
                return Err(Error::config(format!(
                    "trunks '{}' and '{}' share kind {} and key '{}'",
                    previous,
                    trunk.name,
                    trunk.kind,
                    trunk.lookup_key()
                )));
            }
            for group_ref in &trunk.egress.server_groups {
                if !groups.contains_key(&group_ref.name) {
                    return Err(Error::config(format!(
                        "trunk '{}' references unknown server group '{}'",
                        trunk.name, group_ref.name
                    )));
                }
            }
        }

        Ok(Self {
            server_groups: groups,
            failover,
            trunks: trunks.into_iter().map(Arc::new).collect(),
        })
    }

    /// Look up a server group by name.
    pub fn server_group(&self, name: &str) -> Option<Arc<ServerGroup>> {
        self.server_groups.get(name).cloned()
    }

    /// All server groups, in no particular order.
    pub fn server_groups(&self) -> impl Iterator<Item = &Arc<ServerGroup>> {
        self.server_groups.values()
    }

    /// All configured trunks.
    pub fn trunks(&self) -> &[Arc<TrunkConfig>] {
        &self.trunks
    }

    /// Failover policy for a group, with the global fallback applied.
    ///
    /// Groups not present in the snapshot (DNS redirect targets) use the
    /// global policy.
    pub fn failover_policy(&self, group: &str) -> Arc<FailoverPolicy> {
        match self.server_groups.get(group) {
            Some(g) => self.failover.resolve(&g.failover_policy),
            None => self.failover.resolve(crate::domain::failover::GLOBAL_POLICY),
        }
    }

    /// The policy table itself.
    pub fn failover_policies(&self) -> &FailoverPolicies {
        &self.failover
    }
}

/// A lock-free holder of the active [`RoutingConfig`].
///
/// Uses `ArcSwap` so hot reloads never take a read lock on the routing path;
/// an in-flight request keeps the snapshot it started with.
#[derive(Debug)]
pub struct RoutingTable {
    config: ArcSwap<RoutingConfig>,
}

impl RoutingTable {
    /// Create a routing table with the initial snapshot.
    pub fn new(initial: RoutingConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(initial),
        }
    }

    /// Atomically replace the snapshot (config hot-reload).
    pub fn update(&self, config: RoutingConfig) {
        self.config.store(Arc::new(config));
    }

    /// Retrieve the current snapshot.
    pub fn snapshot(&self) -> Arc<RoutingConfig> {
        self.config.load_full()
    }
}

/// A shared reference to the lock-free routing table.
pub type SharedRoutingTable = Arc<RoutingTable>;
