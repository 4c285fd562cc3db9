//! Server group element models.

use std::cmp::Ordering;
use std::fmt;

use crate::domain::endpoint::{endpoint_key, EndPoint, Transport};

/// Where an element came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Declared in configuration.
    Static,
    /// Materialized from a DNS answer; never persisted.
    Dns,
}

/// One candidate destination inside a server group.
///
/// Elements order by descending rank (q-value), then descending weight, then
/// ascending host, port and transport. The last three keys make the order
/// total so that equal-rank, equal-weight elements are always visited in the
/// same sequence.
#[derive(Debug, Clone)]
pub struct ServerGroupElement {
    /// Destination host name or IP literal.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Transport to send over.
    pub transport: Transport,
    /// Ranking value in `[0, 1]`; higher is preferred.
    pub q_value: f32,
    /// Relative share among elements of equal rank.
    pub weight: u32,
    /// Name of the owning server group.
    pub group: String,
    /// Static or DNS-derived.
    pub provenance: Provenance,
}

impl ServerGroupElement {
    /// Create a statically configured element.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        transport: Transport,
        q_value: f32,
        weight: u32,
        group: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            q_value: q_value.clamp(0.0, 1.0),
            weight,
            group: group.into(),
            provenance: Provenance::Static,
        }
    }

    /// Mark the element as materialized from a DNS answer.
    pub fn from_dns(mut self) -> Self {
        self.provenance = Provenance::Dns;
        self
    }

    /// Unique element key, identical to the endpoint key.
    pub fn key(&self) -> String {
        endpoint_key(&self.host, self.port, self.transport)
    }

    /// Endpoint to hand to the transport for this element.
    pub fn endpoint(&self, network: &str) -> EndPoint {
        EndPoint::new(
            self.host.clone(),
            self.port,
            self.transport,
            self.group.clone(),
            network,
        )
    }
}

impl PartialEq for ServerGroupElement {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ServerGroupElement {}

impl PartialOrd for ServerGroupElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerGroupElement {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .q_value
            .total_cmp(&self.q_value)
            .then_with(|| other.weight.cmp(&self.weight))
            .then_with(|| self.host.cmp(&other.host))
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.transport.cmp(&other.transport))
    }
}

impl fmt::Display for ServerGroupElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{};transport={} q={:.3} w={}",
            self.host, self.port, self.transport, self.q_value, self.weight
        )
    }
}
