//! Per-request routing scratch state.

use rsip::prelude::ToTypedHeader;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use trunkline_core::{
    EgressGroupRef, EndPoint, FailoverPolicy, HealthState, LoadBalancer, ServerGroup,
    ServerGroupElement, Transport,
};
use trunkline_filters::sip;

/// A destination chosen for one attempt, with the policy that judges its
/// response.
#[derive(Debug, Clone)]
pub struct Target {
    /// Where the request goes.
    pub endpoint: EndPoint,
    /// Failover policy of the group the endpoint came from.
    pub policy: Arc<FailoverPolicy>,
}

/// A Contact taken from a 3xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    /// Host name or IP literal.
    pub host: String,
    /// Port, when the Contact carried one.
    pub port: Option<u16>,
    /// Transport from the Contact URI, defaulting to UDP.
    pub transport: Transport,
    /// Network of the endpoint that issued the redirect.
    pub network: String,
}

impl RedirectTarget {
    /// Whether the host is an IP literal and needs no resolution.
    pub fn is_literal(&self) -> bool {
        self.host.parse::<std::net::IpAddr>().is_ok()
    }

    /// Endpoint for a literal target.
    pub fn endpoint(&self, group: &str) -> EndPoint {
        EndPoint::new(
            self.host.clone(),
            self.port.unwrap_or_else(|| self.transport.default_port()),
            self.transport,
            group,
            self.network.clone(),
        )
    }

    fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.host,
            self.port.unwrap_or_else(|| self.transport.default_port()),
            self.transport
        )
    }
}

/// An active balancer over one group's elements.
#[derive(Debug)]
pub(crate) struct GroupCursor {
    pub(crate) group: Arc<ServerGroup>,
    pub(crate) policy: Arc<FailoverPolicy>,
    pub(crate) balancer: LoadBalancer<ServerGroupElement>,
}

/// Everything one request's routing loop mutates.
///
/// Owned by exactly one request and passed by `&mut` through the loop, so
/// selection is strictly sequential.
#[derive(Debug)]
pub struct RoutingState {
    request: rsip::Request,
    call_id: String,
    best: Option<rsip::Response>,
    pub(crate) groups: LoadBalancer<EgressGroupRef>,
    pub(crate) elements: Option<GroupCursor>,
    pub(crate) redirect: Option<GroupCursor>,
    redirections: VecDeque<RedirectTarget>,
    queued: HashSet<String>,
    tried: HashSet<String>,
    attempts: u32,
}

impl RoutingState {
    /// Fresh state over a copy of the request.
    pub fn new(request: rsip::Request, call_id: String, groups: LoadBalancer<EgressGroupRef>) -> Self {
        Self {
            request,
            call_id,
            best: None,
            groups,
            elements: None,
            redirect: None,
            redirections: VecDeque::new(),
            queued: HashSet::new(),
            tried: HashSet::new(),
            attempts: 0,
        }
    }

    /// The request as it arrived at the engine.
    pub fn request(&self) -> &rsip::Request {
        &self.request
    }

    /// Call-ID used for affinity and DNS lookups.
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Number of requests actually handed to the transport.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn count_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Best failover response so far.
    pub fn best(&self) -> Option<&rsip::Response> {
        self.best.as_ref()
    }

    /// Remember a failover response if it beats the current best.
    ///
    /// The numerically lowest status code wins; on equal codes the response
    /// seen first is kept.
    pub fn record_best(&mut self, response: rsip::Response) {
        let replace = match &self.best {
            None => true,
            Some(best) => response.status_code.code() < best.status_code.code(),
        };
        if replace {
            self.best = Some(response);
        }
    }

    /// Hand the best response out, leaving none behind.
    pub fn take_best(&mut self) -> Option<rsip::Response> {
        self.best.take()
    }

    /// Mark an endpoint as attempted. Returns `false` if it already was.
    pub fn claim(&mut self, endpoint: &EndPoint) -> bool {
        self.tried.insert(endpoint.key())
    }

    /// Queue the Contact targets of a redirect response.
    ///
    /// Targets already queued or already tried are skipped. Returns how many
    /// new targets were queued.
    pub fn enqueue_redirects(&mut self, response: &rsip::Response, network: &str) -> usize {
        let mut added = 0;
        for target in contact_targets(response, network) {
            let key = target.key();
            if self.tried.contains(&key) || !self.queued.insert(key) {
                continue;
            }
            self.redirections.push_back(target);
            added += 1;
        }
        added
    }

    /// Next queued redirect target, oldest first.
    pub fn next_redirection(&mut self) -> Option<RedirectTarget> {
        self.redirections.pop_front()
    }

    /// Start walking a group's elements, skipping the ones marked down.
    pub(crate) fn use_group(
        &mut self,
        group: Arc<ServerGroup>,
        policy: Arc<FailoverPolicy>,
        health: &HealthState,
    ) {
        let balancer = LoadBalancer::for_group(&group, &self.call_id, health);
        debug!(group = %group.name, candidates = balancer.remaining(), "switching server group");
        self.elements = Some(GroupCursor {
            group,
            policy,
            balancer,
        });
    }

    /// Start walking the elements a redirect target resolved to.
    pub(crate) fn use_redirect_group(
        &mut self,
        group: Arc<ServerGroup>,
        policy: Arc<FailoverPolicy>,
        health: &HealthState,
    ) {
        let balancer = LoadBalancer::for_group(&group, &self.call_id, health);
        self.redirect = Some(GroupCursor {
            group,
            policy,
            balancer,
        });
    }

    /// Next untried element of the redirect group.
    pub(crate) fn next_redirect_target(&mut self) -> Option<Target> {
        let cursor = self.redirect.as_mut()?;
        let target = next_from(cursor, &mut self.tried);
        if target.is_none() {
            self.redirect = None;
        }
        target
    }

    /// Next untried element of the current server group.
    pub(crate) fn next_element_target(&mut self) -> Option<Target> {
        let cursor = self.elements.as_mut()?;
        next_from(cursor, &mut self.tried)
    }
}

fn next_from(cursor: &mut GroupCursor, tried: &mut HashSet<String>) -> Option<Target> {
    while let Some(element) = cursor.balancer.next_candidate() {
        let endpoint = element.endpoint(&cursor.group.network);
        if tried.insert(endpoint.key()) {
            return Some(Target {
                endpoint,
                policy: cursor.policy.clone(),
            });
        }
    }
    None
}

/// Contact URIs of a response as redirect targets, in header order.
///
/// Contacts naming a transport the engine cannot route over are dropped.
pub fn contact_targets(response: &rsip::Response, network: &str) -> Vec<RedirectTarget> {
    response
        .headers
        .iter()
        .filter_map(|header| match header {
            rsip::Header::Contact(contact) => contact.typed().ok(),
            _ => None,
        })
        .filter_map(|contact| {
            let uri = contact.uri;
            let transport = match uri.transport().map(sip::from_rsip_transport) {
                None => Transport::Udp,
                Some(Ok(transport)) => transport,
                Some(Err(e)) => {
                    warn!(contact = %uri, error = %e, "dropping redirect target");
                    return None;
                }
            };
            let host = match &uri.host_with_port.host {
                rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
                rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
            };
            Some(RedirectTarget {
                host,
                port: uri.host_with_port.port.map(|p| *p.value()),
                transport,
                network: network.to_string(),
            })
        })
        .collect()
}
