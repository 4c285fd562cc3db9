//! Supervised OPTIONS ping pipelines.
//!
//! Every probe-enabled server group gets two long-lived tasks on the probe
//! runtime: the up-pipeline re-checks live elements every up-interval (with
//! retries), the down-pipeline re-checks dead elements every down-interval.
//! A pipeline that panics is restarted; a group's pipelines stop when its
//! cancellation token fires.

use futures::future::join_all;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trunkline_core::{
    PingPolicy, ServerGroup, ServerGroupElement, SharedHealthState, SharedRoutingTable,
};

use crate::dns::DnsServerGroupResolver;
use crate::events::{EventBus, RoutingEvent};
use crate::health_check::probe::{send_probe, ProbeResult};
use crate::transport::SharedTransport;

/// Pause before a panicked pipeline is started again.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Which of a group's two loops is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Probes elements currently up.
    Up,
    /// Probes elements currently down.
    Down,
}

impl Pipeline {
    fn as_str(&self) -> &'static str {
        match self {
            Pipeline::Up => "up",
            Pipeline::Down => "down",
        }
    }
}

/// Tally of one probe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Probes that produced a verdict.
    pub probed: usize,
    /// Probes whose verdict was healthy.
    pub succeeded: usize,
    /// Probes refused by the scheduler.
    pub rejected: usize,
}

struct ProbeContext {
    routing: SharedRoutingTable,
    health: SharedHealthState,
    transport: SharedTransport,
    resolver: DnsServerGroupResolver,
    events: EventBus,
    permits: Arc<Semaphore>,
    runtime: Handle,
}

struct Watch {
    group: Arc<ServerGroup>,
    token: CancellationToken,
}

/// Health monitor driving the probe pipelines of every server group.
pub struct OptionsPingMonitor {
    ctx: Arc<ProbeContext>,
    watches: Mutex<HashMap<String, Watch>>,
}

impl std::fmt::Debug for OptionsPingMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionsPingMonitor")
            .field("groups", &self.watched_groups())
            .finish()
    }
}

impl OptionsPingMonitor {
    /// Create a monitor. Pipelines are spawned on `runtime`; at most
    /// `max_concurrent_probes` probes are in flight at once.
    pub fn new(
        routing: SharedRoutingTable,
        health: SharedHealthState,
        transport: SharedTransport,
        resolver: DnsServerGroupResolver,
        events: EventBus,
        runtime: Handle,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            ctx: Arc::new(ProbeContext {
                routing,
                health,
                transport,
                resolver,
                events,
                permits: Arc::new(Semaphore::new(max_concurrent_probes)),
                runtime,
            }),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start, restart or stop pipelines so they match the current snapshot.
    ///
    /// Groups whose definition changed get fresh pipelines; groups that were
    /// removed or lost their ping policy are stopped.
    pub fn reconcile(&self) {
        let snapshot = self.ctx.routing.snapshot();
        let mut watches = self.watches();

        watches.retain(|name, watch| {
            let keep = snapshot
                .server_group(name)
                .map(|group| group.is_probe_enabled() && group == watch.group)
                .unwrap_or(false);
            if !keep {
                debug!(group = %name, "stopping probe pipelines");
                watch.token.cancel();
            }
            keep
        });

        for group in snapshot.server_groups().filter(|g| g.is_probe_enabled()) {
            if watches.contains_key(&group.name) {
                continue;
            }
            let token = CancellationToken::new();
            for pipeline in [Pipeline::Up, Pipeline::Down] {
                spawn_supervised(self.ctx.clone(), group.name.clone(), pipeline, token.clone());
            }
            info!(group = %group.name, "started probe pipelines");
            watches.insert(
                group.name.clone(),
                Watch {
                    group: group.clone(),
                    token,
                },
            );
        }
    }

    /// Names of the groups currently being probed, sorted.
    pub fn watched_groups(&self) -> Vec<String> {
        let mut names: Vec<_> = self.watches().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every pipeline.
    pub fn shutdown(&self) {
        for (name, watch) in self.watches().drain() {
            debug!(group = %name, "stopping probe pipelines");
            watch.token.cancel();
        }
    }

    /// Run one cycle of a pipeline for `group` immediately.
    pub async fn run_cycle(&self, group: &ServerGroup, pipeline: Pipeline) -> CycleReport {
        self.ctx.run_cycle(group, pipeline).await
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<String, Watch>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for OptionsPingMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_supervised(
    ctx: Arc<ProbeContext>,
    group: String,
    pipeline: Pipeline,
    token: CancellationToken,
) {
    let runtime = ctx.runtime.clone();
    runtime.spawn(async move {
        while !token.is_cancelled() {
            let run = ctx
                .runtime
                .spawn(run_pipeline(ctx.clone(), group.clone(), pipeline, token.clone()));
            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!(group = %group, pipeline = pipeline.as_str(), "probe pipeline panicked, restarting");
                    counter!("trunkline_probe_pipeline_restarts_total").increment(1);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RESTART_DELAY) => {}
                    }
                }
                Err(_) => break,
            }
        }
    });
}

async fn run_pipeline(
    ctx: Arc<ProbeContext>,
    group_name: String,
    pipeline: Pipeline,
    token: CancellationToken,
) {
    loop {
        let snapshot = ctx.routing.snapshot();
        let Some(group) = snapshot.server_group(&group_name) else {
            return;
        };
        let Some(policy) = group.ping_policy.as_ref() else {
            return;
        };
        let interval = match pipeline {
            Pipeline::Up => policy.up_interval,
            Pipeline::Down => policy.down_interval,
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = ctx.run_cycle(&group, pipeline) => {}
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

impl ProbeContext {
    async fn run_cycle(&self, configured: &ServerGroup, pipeline: Pipeline) -> CycleReport {
        let Some(policy) = configured.ping_policy.as_ref() else {
            return CycleReport::default();
        };

        let resolved;
        let group = if configured.is_dynamic() {
            match self.resolver.resolve_group(configured, None).await {
                Ok(group) => {
                    resolved = group;
                    &resolved
                }
                Err(e) => {
                    warn!(group = %configured.name, error = %e, "probe re-resolution failed");
                    return CycleReport::default();
                }
            }
        } else {
            configured
        };

        let now = Instant::now();
        let due: Vec<&ServerGroupElement> = group
            .elements
            .iter()
            .filter(|e| {
                let key = e.key();
                match pipeline {
                    Pipeline::Up => {
                        self.health.elements.is_up(&key)
                            && self.health.elements.is_check_due(&key, policy.up_interval, now)
                    }
                    Pipeline::Down => !self.health.elements.is_up(&key),
                }
            })
            .collect();
        if due.is_empty() {
            return CycleReport::default();
        }

        let results = join_all(due.iter().map(|e| self.probe(e, group, policy, pipeline))).await;

        let mut report = CycleReport::default();
        for (element, result) in due.iter().zip(results) {
            let Some(healthy) = result.verdict(policy) else {
                report.rejected += 1;
                counter!("trunkline_probes_total", "result" => "rejected").increment(1);
                continue;
            };
            report.probed += 1;
            if healthy {
                report.succeeded += 1;
            }
            counter!("trunkline_probes_total", "result" => if healthy { "success" } else { "failure" })
                .increment(1);
            self.update_element(&configured.name, element, healthy, &result);
        }

        if report.succeeded > 0 {
            if self.health.groups.set(&configured.name, true) {
                self.events.publish(RoutingEvent::ServerGroupUp {
                    group: configured.name.clone(),
                });
            }
        } else if pipeline == Pipeline::Up && report.probed > 0 {
            let any_up = group
                .elements
                .iter()
                .any(|e| self.health.elements.is_up(&e.key()));
            if !any_up && self.health.groups.set(&configured.name, false) {
                self.events.publish(RoutingEvent::ServerGroupDown {
                    group: configured.name.clone(),
                });
            }
        }
        debug!(
            group = %configured.name,
            pipeline = pipeline.as_str(),
            probed = report.probed,
            succeeded = report.succeeded,
            rejected = report.rejected,
            "probe cycle done"
        );
        report
    }

    /// Probe one element. The up-pipeline retries errors; a response, even a
    /// failing one, is final.
    async fn probe(
        &self,
        element: &ServerGroupElement,
        group: &ServerGroup,
        policy: &PingPolicy,
        pipeline: Pipeline,
    ) -> ProbeResult {
        let endpoint = element.endpoint(&group.network);
        let attempts = match pipeline {
            Pipeline::Up => policy.retries + 1,
            Pipeline::Down => 1,
        };

        let mut last = ProbeResult::Rejected;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.retry_delay).await;
            }
            let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
                debug!(endpoint = %endpoint, "probe rejected, scheduler at capacity");
                return ProbeResult::Rejected;
            };
            last = send_probe(self.transport.as_ref(), &endpoint, policy).await;
            if !matches!(last, ProbeResult::Failed(_)) {
                break;
            }
        }
        last
    }

    fn update_element(
        &self,
        group: &str,
        element: &ServerGroupElement,
        healthy: bool,
        result: &ProbeResult,
    ) {
        let key = element.key();
        if !self.health.elements.set(&key, healthy) {
            return;
        }
        if healthy {
            info!(group, element = %key, "element is up");
            self.events.publish(RoutingEvent::ElementUp {
                group: group.to_string(),
                element: key,
            });
        } else {
            warn!(group, element = %key, result = ?result, "element is down");
            self.events.publish(RoutingEvent::ElementDown {
                group: group.to_string(),
                element: key,
            });
        }
    }
}
