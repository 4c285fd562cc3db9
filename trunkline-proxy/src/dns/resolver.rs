use tracing::{debug, warn};

use trunkline_core::{
    Error, GroupKind, LbType, Result, ServerGroup, ServerGroupElement, Transport,
};

use super::{Hop, LocateQuery, RecordType, SharedDnsLookup};

/// Largest SRV priority; ranks are scaled against it.
pub const MAX_PRIORITY: u16 = u16::MAX;

/// Rank of an SRV hop: lower priorities map to higher ranks in `[0, 1]`.
pub fn rank_for_priority(priority: u16) -> f32 {
    (MAX_PRIORITY - priority) as f32 / MAX_PRIORITY as f32
}

/// Turns a DNS host into a freshly built [`ServerGroup`].
///
/// Nothing is cached: every call queries the lookup service again and the
/// result is a new immutable group.
#[derive(Clone)]
pub struct DnsServerGroupResolver {
    lookup: SharedDnsLookup,
}

impl std::fmt::Debug for DnsServerGroupResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServerGroupResolver").finish_non_exhaustive()
    }
}

impl DnsServerGroupResolver {
    /// Create a resolver over a lookup service.
    pub fn new(lookup: SharedDnsLookup) -> Self {
        Self { lookup }
    }

    /// Resolve `host` into a group named after it.
    pub async fn resolve(
        &self,
        host: &str,
        network: &str,
        transport: Transport,
        lb_type: LbType,
        user_id: Option<&str>,
    ) -> Result<ServerGroup> {
        self.resolve_with_port(host, None, network, transport, lb_type, user_id)
            .await
    }

    /// [`DnsServerGroupResolver::resolve`] with an explicit port for A answers.
    pub async fn resolve_with_port(
        &self,
        host: &str,
        port: Option<u16>,
        network: &str,
        transport: Transport,
        lb_type: LbType,
        user_id: Option<&str>,
    ) -> Result<ServerGroup> {
        let (hops, transport) = self.locate(host, port, transport, user_id).await?;
        if hops.is_empty() {
            return Err(Error::dns(host, "no hops"));
        }

        let mut builder = ServerGroup::builder(host)
            .network(network)
            .lb_type(lb_type)
            .dns(host, port)
            .transport(transport);
        for hop in hops {
            let element = ServerGroupElement::new(
                hop.host,
                hop.port,
                transport,
                rank_for_priority(hop.priority),
                hop.weight as u32,
                host,
            )
            .from_dns();
            builder = builder.element(element);
        }
        let group = builder.build();
        debug!(group = %group, %transport, "resolved dns server group");
        Ok(group)
    }

    /// Resolve a configured DNS group, keeping its policies.
    pub async fn resolve_group(
        &self,
        parent: &ServerGroup,
        user_id: Option<&str>,
    ) -> Result<ServerGroup> {
        let GroupKind::DnsSrvA { host, port } = &parent.kind else {
            return Ok(parent.clone());
        };
        let resolved = self
            .resolve_with_port(
                host,
                *port,
                &parent.network,
                parent.transport,
                parent.lb_type,
                user_id,
            )
            .await?;
        Ok(ServerGroup {
            failover_policy: parent.failover_policy.clone(),
            ping_policy: parent.ping_policy.clone(),
            ..resolved
        })
    }

    /// Run the per-transport query strategy, returning the hops and the
    /// transport implied by the service that answered.
    async fn locate(
        &self,
        host: &str,
        port: Option<u16>,
        transport: Transport,
        user_id: Option<&str>,
    ) -> Result<(Vec<Hop>, Transport)> {
        let services: &[(&str, Transport)] = match transport {
            Transport::Tls => &[("_sips._tcp", Transport::Tls), ("_sip._tcp", Transport::Tcp)],
            Transport::Tcp => &[("_sip._tcp", Transport::Tcp), ("_sips._tcp", Transport::Tls)],
            Transport::Udp => {
                let hops = self
                    .lookup
                    .locate(LocateQuery {
                        name: host.to_string(),
                        record: RecordType::A,
                        transport,
                        port,
                        user_id: user_id.map(str::to_string),
                    })
                    .await?;
                let port = port.unwrap_or_else(|| transport.default_port());
                let hops = hops
                    .into_iter()
                    .map(|hop| Hop { port, ..hop })
                    .collect();
                return Ok((hops, transport));
            }
        };

        let mut last_error = Error::dns(host, "no hops");
        for (service, service_transport) in services {
            let query = LocateQuery {
                name: format!("{service}.{host}"),
                record: RecordType::Srv,
                transport: *service_transport,
                port,
                user_id: user_id.map(str::to_string),
            };
            match self.lookup.locate(query).await {
                Ok(hops) if !hops.is_empty() => return Ok((hops, *service_transport)),
                Ok(_) => debug!(%host, service, "empty SRV answer"),
                Err(e) => {
                    warn!(%host, service, error = %e, "SRV lookup failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
