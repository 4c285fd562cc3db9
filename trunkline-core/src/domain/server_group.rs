//! Server groups and their health-check policy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use crate::domain::element::ServerGroupElement;
use crate::domain::endpoint::Transport;

/// Load balancing strategy used within one rank tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbType {
    /// Strict rank order with a deterministic tie-break.
    #[default]
    HighestQ,
    /// Weighted random order among candidates of equal rank.
    Weight,
    /// Call-ID rendezvous hash among candidates of equal rank.
    CallId,
}

/// How a group's elements are obtained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Elements are listed in configuration.
    Static,
    /// Elements are resolved through SRV (or A) records at routing time.
    DnsSrvA {
        /// Host name to resolve.
        host: String,
        /// Port used for A-record answers; SRV answers carry their own.
        port: Option<u16>,
    },
}

/// OPTIONS ping settings for a server group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPolicy {
    /// Policy name.
    pub name: String,
    /// Probe period while elements are up.
    pub up_interval: Duration,
    /// Probe period while elements are down.
    pub down_interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Response codes that mark an element down.
    pub failure_codes: HashSet<u16>,
    /// Extra attempts made by the up-pipeline after a failed probe.
    pub retries: u32,
    /// Fixed pause between up-pipeline retries.
    pub retry_delay: Duration,
    /// Max-Forwards value for the probe request.
    pub max_forwards: u8,
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            up_interval: Duration::from_secs(30),
            down_interval: Duration::from_secs(5),
            timeout: Duration::from_millis(500),
            failure_codes: [408, 500, 502, 503, 504].into_iter().collect(),
            retries: 1,
            retry_delay: Duration::from_millis(500),
            max_forwards: 70,
        }
    }
}

impl PingPolicy {
    /// Whether a probe response code counts as a failure.
    pub fn is_failure(&self, code: u16) -> bool {
        self.failure_codes.contains(&code)
    }
}

/// A named, ordered set of destinations sharing a balancing and failover policy.
///
/// Groups are immutable snapshots: reconfiguration and DNS re-resolution
/// always build a new group instead of editing one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerGroup {
    /// Unique group name.
    pub name: String,
    /// Network the group is reached through.
    pub network: String,
    /// Elements in routing order.
    pub elements: BTreeSet<ServerGroupElement>,
    /// Strategy within equal-rank tiers.
    pub lb_type: LbType,
    /// Static or DNS-backed.
    pub kind: GroupKind,
    /// Transport used for DNS lookups and A-record answers.
    pub transport: Transport,
    /// Failover policy name; resolved against the policy table.
    pub failover_policy: String,
    /// Health-check settings, if probing is enabled.
    pub ping_policy: Option<PingPolicy>,
}

impl ServerGroup {
    /// Start building a static group.
    pub fn builder(name: impl Into<String>) -> ServerGroupBuilder {
        ServerGroupBuilder::new(name)
    }

    /// Whether elements come from DNS.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, GroupKind::DnsSrvA { .. })
    }

    /// Whether the health monitor should probe this group.
    pub fn is_probe_enabled(&self) -> bool {
        self.ping_policy.is_some()
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} elements)", self.name, self.elements.len())
    }
}

/// Builder for [`ServerGroup`].
#[derive(Debug)]
pub struct ServerGroupBuilder {
    group: ServerGroup,
}

impl ServerGroupBuilder {
    /// Create a builder for a static group on the default network.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group: ServerGroup {
                name: name.into(),
                network: "default".to_string(),
                elements: BTreeSet::new(),
                lb_type: LbType::default(),
                kind: GroupKind::Static,
                transport: Transport::Udp,
                failover_policy: "global".to_string(),
                ping_policy: None,
            },
        }
    }

    /// Set the network.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.group.network = network.into();
        self
    }

    /// Add an element; its group back-reference is set to this group.
    pub fn element(mut self, mut element: ServerGroupElement) -> Self {
        element.group = self.group.name.clone();
        self.group.elements.insert(element);
        self
    }

    /// Set the load balancer type.
    pub fn lb_type(mut self, lb_type: LbType) -> Self {
        self.group.lb_type = lb_type;
        self
    }

    /// Make the group DNS-backed.
    pub fn dns(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.group.kind = GroupKind::DnsSrvA {
            host: host.into(),
            port,
        };
        self
    }

    /// Set the transport.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.group.transport = transport;
        self
    }

    /// Set the failover policy name.
    pub fn failover_policy(mut self, name: impl Into<String>) -> Self {
        self.group.failover_policy = name.into();
        self
    }

    /// Enable probing with the given policy.
    pub fn ping_policy(mut self, policy: PingPolicy) -> Self {
        self.group.ping_policy = Some(policy);
        self
    }

    /// Finish the group.
    pub fn build(self) -> ServerGroup {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_element_back_reference() {
        let group = ServerGroup::builder("SG1")
            .element(ServerGroupElement::new(
                "1.1.1.1",
                5060,
                Transport::Udp,
                0.9,
                1,
                "other",
            ))
            .build();

        assert_eq!(group.elements.iter().next().unwrap().group, "SG1");
        assert!(!group.is_dynamic());
        assert!(!group.is_probe_enabled());
    }
}
