//! Trunk definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::server_group::LbType;
use crate::error::Error;

/// The normalization flavour a trunk applies around the shared engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrunkKind {
    /// Peering trunk towards another carrier; follows redirects.
    B2b,
    /// Trunk towards a call-control cluster; a specialization of [`TrunkKind::B2b`].
    CallingCore,
}

impl TrunkKind {
    /// Stable name used in logs and lookups.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrunkKind::B2b => "b2b",
            TrunkKind::CallingCore => "calling-core",
        }
    }
}

impl fmt::Display for TrunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrunkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b2b" => Ok(TrunkKind::B2b),
            "calling-core" => Ok(TrunkKind::CallingCore),
            other => Err(Error::config(format!("unknown trunk kind '{other}'"))),
        }
    }
}

/// Inbound side of a trunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IngressConfig {
    /// Ingress name.
    pub name: String,
    /// Request-URI parameters removed before routing.
    pub strip_params: Vec<String>,
}

/// A server group attached to a trunk's egress.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressGroupRef {
    /// Server group name.
    pub name: String,
    /// Rank of the group among the trunk's groups, in `[0, 1]`.
    pub priority: f32,
    /// Share among groups of equal priority.
    pub weight: u32,
}

impl EgressGroupRef {
    /// Create a reference with full priority.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 1.0,
            weight: 100,
        }
    }

    /// Set priority and weight.
    pub fn ranked(mut self, priority: f32, weight: u32) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self.weight = weight;
        self
    }
}

/// Outbound side of a trunk.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressConfig {
    /// Strategy used to order the attached server groups.
    pub lb_type: LbType,
    /// Attached server groups.
    pub server_groups: Vec<EgressGroupRef>,
    /// Deadline for the whole routing loop of one request.
    pub response_timeout: Duration,
    /// Selector key such as a trunk-group tag.
    pub selector: Option<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            lb_type: LbType::HighestQ,
            server_groups: Vec::new(),
            response_timeout: Duration::from_secs(32),
            selector: None,
        }
    }
}

/// A configured trunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TrunkConfig {
    /// Trunk name.
    pub name: String,
    /// Normalization flavour.
    pub kind: TrunkKind,
    /// Inbound settings.
    pub ingress: IngressConfig,
    /// Outbound settings.
    pub egress: EgressConfig,
}

impl TrunkConfig {
    /// Key the trunk is registered under: the selector, or the trunk name.
    pub fn lookup_key(&self) -> &str {
        self.egress.selector.as_deref().unwrap_or(&self.name)
    }
}
