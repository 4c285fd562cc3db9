//! Trunk registry and request entry points.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use trunkline_core::{Error, Result, RoutingConfig, TrunkKind};

use crate::engine::TrunkRoutingEngine;
use crate::health_check::OptionsPingMonitor;
use crate::trunk::Trunk;

type TrunkMap = HashMap<(TrunkKind, String), Trunk>;

/// Up/down view of one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementStatus {
    /// Element key
    pub key: String,
    /// Whether the element is routable
    pub up: bool,
}

/// Up/down view of one server group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    /// Group name
    pub name: String,
    /// Whether the group is routable; unmonitored groups are always up
    pub up: bool,
    /// Whether a ping policy drives the status
    pub monitored: bool,
    /// Static elements; DNS groups list none
    pub elements: Vec<ElementStatus>,
}

/// Up/down view of one trunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrunkStatus {
    /// Trunk name
    pub name: String,
    /// Trunk kind
    pub kind: String,
    /// Registry key
    pub key: String,
    /// Whether at least one attached group is up
    pub up: bool,
    /// Attached groups in configuration order
    pub groups: Vec<GroupStatus>,
}

/// Periodic snapshot of every trunk's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Unix time of the snapshot in milliseconds
    pub generated_at_ms: u64,
    /// Trunks sorted by name
    pub trunks: Vec<TrunkStatus>,
}

/// Looks trunks up by kind and key and hands requests to the engine.
pub struct TrunkManager {
    engine: TrunkRoutingEngine,
    trunks: ArcSwap<TrunkMap>,
    monitor: Option<Arc<OptionsPingMonitor>>,
    report: ArcSwap<HealthReport>,
}

impl std::fmt::Debug for TrunkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkManager")
            .field("trunks", &self.trunks.load().len())
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl TrunkManager {
    /// Build the registry from the engine's current routing snapshot.
    pub fn new(engine: TrunkRoutingEngine) -> Self {
        let trunks = build_trunks(&engine.routing().snapshot());
        Self {
            engine,
            trunks: ArcSwap::from_pointee(trunks),
            monitor: None,
            report: ArcSwap::from_pointee(HealthReport::default()),
        }
    }

    /// Attach the health monitor reconciled on every reconfiguration.
    pub fn with_monitor(mut self, monitor: Arc<OptionsPingMonitor>) -> Self {
        monitor.reconcile();
        self.monitor = Some(monitor);
        self
    }

    /// The shared engine.
    pub fn engine(&self) -> &TrunkRoutingEngine {
        &self.engine
    }

    /// Look a trunk up.
    pub fn trunk(&self, kind: TrunkKind, key: &str) -> Result<Trunk> {
        self.trunks
            .load()
            .get(&(kind, key.to_string()))
            .cloned()
            .ok_or_else(|| Error::UnknownTrunk {
                kind: kind.to_string(),
                key: key.to_string(),
            })
    }

    /// Apply the trunk's ingress normalization and return the request.
    pub fn handle_ingress(
        &self,
        kind: TrunkKind,
        mut request: rsip::Request,
        key: &str,
    ) -> Result<rsip::Request> {
        let trunk = self.trunk(kind, key)?;
        trunk.normalize_ingress(&mut request)?;
        Ok(request)
    }

    /// Normalize a request on the trunk's ingress and route it out of its
    /// egress.
    pub async fn handle_egress(
        &self,
        kind: TrunkKind,
        mut request: rsip::Request,
        key: &str,
    ) -> Result<rsip::Response> {
        let trunk = self.trunk(kind, key)?;
        trunk.normalize_ingress(&mut request)?;
        self.engine.process_egress(&trunk, request).await
    }

    /// Swap in a new routing snapshot.
    ///
    /// In-flight requests keep the snapshot they started with. Trunks are
    /// rebuilt and the health monitor restarts pipelines of changed groups.
    pub fn reconfigure(&self, config: RoutingConfig) {
        let trunks = build_trunks(&config);
        let groups = config.server_groups().count();
        self.engine.routing().update(config);
        self.trunks.store(Arc::new(trunks));
        if let Some(monitor) = &self.monitor {
            monitor.reconcile();
        }
        info!(trunks = self.trunks.load().len(), groups, "routing reconfigured");
    }

    /// Latest report produced by the status reporter.
    pub fn health_report(&self) -> Arc<HealthReport> {
        self.report.load_full()
    }

    /// Compute a report from the current status tables.
    pub fn collect_status(&self) -> HealthReport {
        let snapshot = self.engine.routing().snapshot();
        let health = self.engine.health();

        let mut trunks: Vec<TrunkStatus> = self
            .trunks
            .load()
            .iter()
            .map(|((kind, key), trunk)| {
                let groups: Vec<GroupStatus> = trunk
                    .config()
                    .egress
                    .server_groups
                    .iter()
                    .map(|group_ref| {
                        let group = snapshot.server_group(&group_ref.name);
                        let monitored = group
                            .as_ref()
                            .map(|g| g.is_probe_enabled())
                            .unwrap_or(false);
                        let elements = group
                            .as_ref()
                            .map(|g| {
                                g.elements
                                    .iter()
                                    .map(|e| {
                                        let key = e.key();
                                        ElementStatus {
                                            up: !monitored || health.elements.is_up(&key),
                                            key,
                                        }
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        GroupStatus {
                            name: group_ref.name.clone(),
                            up: !monitored || health.groups.is_up(&group_ref.name),
                            monitored,
                            elements,
                        }
                    })
                    .collect();
                TrunkStatus {
                    name: trunk.name().to_string(),
                    kind: kind.to_string(),
                    key: key.clone(),
                    up: groups.iter().any(|g| g.up),
                    groups,
                }
            })
            .collect();
        trunks.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.kind.cmp(&b.kind)));

        HealthReport {
            generated_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            trunks,
        }
    }

    /// Refresh the health report every `period` until cancelled.
    ///
    /// The reporter only reads the status tables, so routing never waits on it.
    pub fn spawn_status_reporter(
        self: &Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = manager.collect_status();
                        debug!(
                            trunks = report.trunks.len(),
                            down = report.trunks.iter().filter(|t| !t.up).count(),
                            "status report refreshed"
                        );
                        manager.report.store(Arc::new(report));
                    }
                }
            }
        })
    }
}

fn build_trunks(config: &RoutingConfig) -> TrunkMap {
    config
        .trunks()
        .iter()
        .map(|cfg| {
            (
                (cfg.kind, cfg.lookup_key().to_string()),
                Trunk::new(cfg.clone()),
            )
        })
        .collect()
}
