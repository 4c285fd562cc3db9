//! DNS-backed server groups.
//!
//! Trunkline does not ship a resolver of its own. [`DnsLookup`] is the seam a
//! deployment plugs its resolver into; [`SystemLookup`] covers plain A/AAAA
//! answers through the operating system.

mod resolver;

pub use resolver::{rank_for_priority, DnsServerGroupResolver, MAX_PRIORITY};

use async_trait::async_trait;
use std::sync::Arc;

use trunkline_core::{Error, Result, Transport};

/// Record type requested from the lookup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// SRV lookup of a `_service._proto.host` name.
    Srv,
    /// Address lookup.
    A,
}

/// One lookup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateQuery {
    /// Name to query; for SRV this already carries the service prefix.
    pub name: String,
    /// Record type.
    pub record: RecordType,
    /// Transport hint.
    pub transport: Transport,
    /// Port used for A answers.
    pub port: Option<u16>,
    /// Caller identity forwarded to lookup services that shard by user.
    pub user_id: Option<String>,
}

/// One answer from a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// SRV priority; lower is preferred. Zero for A answers.
    pub priority: u16,
    /// SRV weight.
    pub weight: u16,
}

impl Hop {
    /// Create a hop.
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }
}

/// External DNS lookup service.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Answer a query. An empty answer is not an error at this level.
    async fn locate(&self, query: LocateQuery) -> Result<Vec<Hop>>;
}

/// Shared handle to a lookup service.
pub type SharedDnsLookup = Arc<dyn DnsLookup>;

/// Lookup through the operating system resolver.
///
/// Only address records are supported; SRV queries fail with [`Error::Dns`],
/// which makes TCP and TLS groups fall back to their second SRV service and
/// then to the next server group.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl DnsLookup for SystemLookup {
    async fn locate(&self, query: LocateQuery) -> Result<Vec<Hop>> {
        if query.record == RecordType::Srv {
            return Err(Error::dns(query.name, "SRV lookups are not supported"));
        }
        let port = query.port.unwrap_or_else(|| query.transport.default_port());
        let addrs = tokio::net::lookup_host((query.name.as_str(), port))
            .await
            .map_err(|e| Error::dns(&query.name, e.to_string()))?;
        Ok(addrs
            .map(|addr| Hop::new(addr.ip().to_string(), addr.port(), 0, 1))
            .collect())
    }
}
