//! The shared trunk routing engine.
//!
//! One call to [`TrunkRoutingEngine::process_egress`] walks a trunk's server
//! groups and their elements until an endpoint gives a final answer, the
//! candidates run out or the trunk's response timeout fires. Trunk kinds plug
//! in through their normalizer only.

mod state;

pub use state::{contact_targets, RedirectTarget, RoutingState, Target};

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use trunkline_core::{
    CircuitBreakerRegistry, Error, LbType, LoadBalancer, Outcome, Result, RoutingConfig,
    SharedHealthState, SharedRoutingTable, GLOBAL_POLICY,
};
use trunkline_filters::sip;

use crate::dns::DnsServerGroupResolver;
use crate::transport::SharedTransport;
use crate::trunk::Trunk;

/// Group name given to endpoints taken straight from a Contact header.
pub const REDIRECT_GROUP: &str = "redirect";

/// Decides whether an attempt counts as a failure for the circuit breaker.
pub type FailurePredicate = Arc<dyn Fn(&Result<rsip::Response>) -> bool + Send + Sync>;

/// 502, 503 and 504 responses and every transport error or timeout.
pub fn default_failure_predicate() -> FailurePredicate {
    Arc::new(|result| match result {
        Ok(response) => matches!(response.status_code.code(), 502..=504),
        Err(_) => true,
    })
}

/// Routing engine shared by every trunk.
#[derive(Clone)]
pub struct TrunkRoutingEngine {
    routing: SharedRoutingTable,
    health: SharedHealthState,
    breakers: Arc<CircuitBreakerRegistry>,
    transport: SharedTransport,
    resolver: DnsServerGroupResolver,
    failure_predicate: FailurePredicate,
}

impl std::fmt::Debug for TrunkRoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkRoutingEngine")
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}

impl TrunkRoutingEngine {
    /// Create an engine over the shared routing, health and breaker state.
    pub fn new(
        routing: SharedRoutingTable,
        health: SharedHealthState,
        breakers: Arc<CircuitBreakerRegistry>,
        transport: SharedTransport,
        resolver: DnsServerGroupResolver,
    ) -> Self {
        Self {
            routing,
            health,
            breakers,
            transport,
            resolver,
            failure_predicate: default_failure_predicate(),
        }
    }

    /// Replace the circuit breaker failure predicate.
    pub fn with_failure_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.failure_predicate = predicate;
        self
    }

    /// The routing table the engine reads snapshots from.
    pub fn routing(&self) -> &SharedRoutingTable {
        &self.routing
    }

    /// Shared element and group status.
    pub fn health(&self) -> &SharedHealthState {
        &self.health
    }

    /// Per-endpoint circuit breakers.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// DNS group resolver.
    pub fn resolver(&self) -> &DnsServerGroupResolver {
        &self.resolver
    }

    /// Route a request out of `trunk`.
    ///
    /// Returns the first final response that is neither a failover code nor a
    /// followed redirect. When the candidates run out, or the trunk's response
    /// timeout fires, the best failover response seen is returned instead;
    /// without one the result is [`Error::NoMoreEndpoints`] or
    /// [`Error::Timeout`].
    #[instrument(skip_all, fields(trunk = %trunk.name()))]
    pub async fn process_egress(&self, trunk: &Trunk, request: rsip::Request) -> Result<rsip::Response> {
        let call_id = sip::call_id(&request)?;
        let snapshot = self.routing.snapshot();
        let egress = &trunk.config().egress;
        let groups = LoadBalancer::for_egress(&egress.server_groups, egress.lb_type, &call_id, &self.health);
        let mut state = RoutingState::new(request, call_id, groups);

        let deadline = egress.response_timeout;
        let outcome = tokio::time::timeout(deadline, self.route(trunk, &snapshot, &mut state)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                counter!("trunkline_egress_timeouts_total", "trunk" => trunk.name().to_string())
                    .increment(1);
                warn!(
                    attempts = state.attempts(),
                    has_best = state.best().is_some(),
                    timeout_ms = deadline.as_millis() as u64,
                    "trunk response timeout"
                );
                state
                    .take_best()
                    .ok_or_else(|| Error::timeout(format!("egress via {}", trunk.name()), deadline))
            }
        }
    }

    async fn route(
        &self,
        trunk: &Trunk,
        snapshot: &RoutingConfig,
        state: &mut RoutingState,
    ) -> Result<rsip::Response> {
        let follow_redirects = trunk.normalizer().enable_redirection();

        loop {
            let Some(target) = self.next_target(snapshot, state).await else {
                debug!(attempts = state.attempts(), "no more endpoints");
                return state.take_best().ok_or(Error::NoMoreEndpoints);
            };
            let endpoint = target.endpoint;
            let key = endpoint.key();

            let mut outbound = state.request().clone();
            trunk
                .normalizer()
                .normalize_egress(&mut outbound, &endpoint, trunk.config())?;

            let permit = match self.breakers.acquire(&key) {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(error = %e, "skipping endpoint");
                    counter!("trunkline_circuit_rejections_total").increment(1);
                    continue;
                }
            };

            state.count_attempt();
            counter!("trunkline_egress_attempts_total", "trunk" => trunk.name().to_string())
                .increment(1);
            let result = self.transport.send(&endpoint, outbound).await;
            let outcome = if (self.failure_predicate)(&result) {
                Outcome::Failure
            } else {
                Outcome::Success
            };
            permit.record(outcome);

            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    warn!(endpoint = %key, error = %e, "attempt failed, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let code = response.status_code.code();
            if target.policy.should_failover(code) {
                debug!(endpoint = %key, code, "failover response");
                state.record_best(response);
                continue;
            }
            if follow_redirects && (300..400).contains(&code) {
                let queued = state.enqueue_redirects(&response, &endpoint.network);
                debug!(endpoint = %key, code, queued, "following redirect");
                continue;
            }

            info!(endpoint = %key, code, attempts = state.attempts(), "final response");
            return Ok(response);
        }
    }

    /// Next endpoint to try: redirect targets first, then the current
    /// group's elements, then the next server group.
    async fn next_target(&self, snapshot: &RoutingConfig, state: &mut RoutingState) -> Option<Target> {
        loop {
            if let Some(target) = state.next_redirect_target() {
                return Some(target);
            }

            if let Some(redirect) = state.next_redirection() {
                let policy = snapshot.failover_policies().resolve(GLOBAL_POLICY);
                if redirect.is_literal() {
                    let endpoint = redirect.endpoint(REDIRECT_GROUP);
                    if state.claim(&endpoint) {
                        return Some(Target { endpoint, policy });
                    }
                    continue;
                }
                let resolved = self
                    .resolver
                    .resolve_with_port(
                        &redirect.host,
                        redirect.port,
                        &redirect.network,
                        redirect.transport,
                        LbType::HighestQ,
                        Some(state.call_id()),
                    )
                    .await;
                match resolved {
                    Ok(group) => state.use_redirect_group(Arc::new(group), policy, &self.health),
                    Err(e) => warn!(host = %redirect.host, error = %e, "redirect target did not resolve"),
                }
                continue;
            }

            if let Some(target) = state.next_element_target() {
                return Some(target);
            }

            let group_ref = state.groups.next_candidate()?;
            let Some(group) = snapshot.server_group(&group_ref.name) else {
                warn!(group = %group_ref.name, "server group missing from snapshot");
                continue;
            };
            let policy = snapshot.failover_policy(&group.name);
            let group = if group.is_dynamic() {
                match self.resolver.resolve_group(&group, Some(state.call_id())).await {
                    Ok(resolved) => Arc::new(resolved),
                    Err(e) => {
                        warn!(group = %group.name, error = %e, "dns resolution failed, trying next group");
                        continue;
                    }
                }
            } else {
                group
            };
            state.use_group(group, policy, &self.health);
        }
    }
}
