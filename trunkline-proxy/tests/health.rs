//! OPTIONS health monitor pipelines and the status report.

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use common::*;
use trunkline_core::{
    EndPoint, Error, HealthState, PingPolicy, RoutingTable, ServerGroup, ServerGroupElement,
    SharedHealthState, Transport, TrunkKind,
};
use trunkline_proxy::dns::{DnsServerGroupResolver, Hop};
use trunkline_proxy::health_check::{OptionsPingMonitor, Pipeline};
use trunkline_proxy::{EventBus, RoutingEvent, SipTransport, TrunkManager};

fn policy(retries: u32) -> PingPolicy {
    PingPolicy {
        name: "fast".into(),
        timeout: Duration::from_secs(1),
        retries,
        retry_delay: Duration::from_millis(10),
        ..PingPolicy::default()
    }
}

fn monitored(name: &str, hosts: &[&str], retries: u32) -> ServerGroup {
    hosts
        .iter()
        .fold(
            ServerGroup::builder(name).network("net_sp").ping_policy(policy(retries)),
            |builder, host| {
                builder.element(ServerGroupElement::new(*host, 5060, Transport::Udp, 1.0, 100, name))
            },
        )
        .build()
}

struct Harness {
    monitor: OptionsPingMonitor,
    routing: Arc<RoutingTable>,
    health: SharedHealthState,
    events: broadcast::Receiver<RoutingEvent>,
}

/// Panics on its first send, then answers from a script.
struct PanicsOnce {
    calls: AtomicUsize,
    script: Arc<ScriptedTransport>,
}

#[async_trait]
impl SipTransport for PanicsOnce {
    async fn send(
        &self,
        endpoint: &EndPoint,
        request: rsip::Request,
    ) -> trunkline_core::Result<rsip::Response> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("transport blew up");
        }
        self.script.send(endpoint, request).await
    }
}

fn harness(
    groups: Vec<ServerGroup>,
    transport: Arc<dyn SipTransport>,
    dns: Arc<StaticDns>,
    permits: usize,
) -> Harness {
    let routing = Arc::new(RoutingTable::new(common::routing(groups, vec![], &[503])));
    let health = Arc::new(HealthState::new());
    let bus = EventBus::new(64);
    let events = bus.subscribe();
    let monitor = OptionsPingMonitor::new(
        routing.clone(),
        health.clone(),
        transport,
        DnsServerGroupResolver::new(dns),
        bus,
        tokio::runtime::Handle::current(),
        permits,
    );
    Harness {
        monitor,
        routing,
        health,
        events,
    }
}

fn drain(rx: &mut broadcast::Receiver<RoutingEvent>) -> Vec<RoutingEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

fn element_down(group: &str, host: &str) -> RoutingEvent {
    RoutingEvent::ElementDown {
        group: group.into(),
        element: key(host),
    }
}

#[tokio::test]
async fn down_is_reported_once_and_recovery_once() {
    let group = monitored("SG1", &["10.0.0.1"], 0);
    let transport = ScriptedTransport::new();
    transport
        .reply(&key("10.0.0.1"), Reply::Status(503))
        .reply(&key("10.0.0.1"), Reply::Status(503))
        .reply(&key("10.0.0.1"), Reply::Status(503))
        .reply(&key("10.0.0.1"), Reply::Status(200));
    let mut h = harness(vec![group.clone()], transport.clone(), StaticDns::new(), 8);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;
    assert_eq!((report.probed, report.succeeded), (1, 0));
    assert!(!h.health.elements.is_up(&key("10.0.0.1")));
    assert!(!h.health.groups.is_up("SG1"));
    assert_eq!(
        drain(&mut h.events),
        vec![
            element_down("SG1", "10.0.0.1"),
            RoutingEvent::ServerGroupDown { group: "SG1".into() },
        ]
    );

    for _ in 0..2 {
        let report = h.monitor.run_cycle(&group, Pipeline::Down).await;
        assert_eq!(report.probed, 1);
        assert!(drain(&mut h.events).is_empty());
    }

    let report = h.monitor.run_cycle(&group, Pipeline::Down).await;
    assert_eq!(report.succeeded, 1);
    assert!(h.health.elements.is_up(&key("10.0.0.1")));
    assert!(h.health.groups.is_up("SG1"));
    assert_eq!(
        drain(&mut h.events),
        vec![
            RoutingEvent::ElementUp {
                group: "SG1".into(),
                element: key("10.0.0.1"),
            },
            RoutingEvent::ServerGroupUp { group: "SG1".into() },
        ]
    );
    assert_eq!(transport.sent().len(), 4);
}

#[tokio::test]
async fn up_pipeline_ignores_elements_already_down() {
    let group = monitored("SG1", &["10.0.0.1"], 0);
    let transport = ScriptedTransport::new();
    let mut h = harness(vec![group.clone()], transport.clone(), StaticDns::new(), 8);
    h.health.elements.set(&key("10.0.0.1"), false);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!(report, Default::default());
    assert!(transport.sent().is_empty());
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn rejected_probes_leave_status_alone() {
    let group = monitored("SG1", &["10.0.0.1", "10.0.0.2"], 0);
    let transport = ScriptedTransport::new();
    let mut h = harness(vec![group.clone()], transport.clone(), StaticDns::new(), 0);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!(report.rejected, 2);
    assert_eq!(report.probed, 0);
    assert!(transport.sent().is_empty());
    assert!(h.health.elements.get(&key("10.0.0.1")).is_none());
    assert!(h.health.groups.is_up("SG1"));
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn group_stays_up_while_any_element_answers() {
    let group = monitored("SG1", &["10.0.0.1", "10.0.0.2"], 0);
    let transport = ScriptedTransport::new();
    transport
        .reply(&key("10.0.0.1"), Reply::Status(503))
        .reply(&key("10.0.0.2"), Reply::Status(200));
    let mut h = harness(vec![group.clone()], transport, StaticDns::new(), 8);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!((report.probed, report.succeeded), (2, 1));
    assert!(!h.health.elements.is_up(&key("10.0.0.1")));
    assert!(h.health.elements.is_up(&key("10.0.0.2")));
    assert!(h.health.groups.is_up("SG1"));
    assert_eq!(drain(&mut h.events), vec![element_down("SG1", "10.0.0.1")]);
}

#[tokio::test(start_paused = true)]
async fn up_pipeline_retries_failed_probes() {
    let group = monitored("SG1", &["10.0.0.1"], 1);
    let transport = ScriptedTransport::new();
    transport
        .reply(
            &key("10.0.0.1"),
            Reply::Fail(Error::transport(key("10.0.0.1"), "host unreachable")),
        )
        .reply(&key("10.0.0.1"), Reply::Status(200));
    let mut h = harness(vec![group.clone()], transport.clone(), StaticDns::new(), 8);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.sent().len(), 2);
    assert!(h.health.elements.is_up(&key("10.0.0.1")));
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn probe_timeout_counts_as_failure() {
    let group = monitored("SG1", &["10.0.0.1"], 0);
    let transport = ScriptedTransport::new();
    transport.reply(&key("10.0.0.1"), Reply::Hang);
    let h = harness(vec![group.clone()], transport, StaticDns::new(), 8);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!((report.probed, report.succeeded), (1, 0));
    assert!(!h.health.elements.is_up(&key("10.0.0.1")));
}

#[tokio::test]
async fn dns_groups_are_resolved_before_probing() {
    let group = ServerGroup::builder("SG_DNS")
        .network("net_sp")
        .dns("sip.example.com", None)
        .ping_policy(policy(0))
        .build();
    let dns = StaticDns::new();
    dns.answer("sip.example.com", Ok(vec![Hop::new("10.0.0.5", 0, 0, 1)]));
    let transport = ScriptedTransport::new();
    transport.reply(&key("10.0.0.5"), Reply::Status(503));
    let mut h = harness(vec![group.clone()], transport.clone(), dns, 8);

    let report = h.monitor.run_cycle(&group, Pipeline::Up).await;

    assert_eq!(report.probed, 1);
    assert_eq!(transport.sent_keys(), vec![key("10.0.0.5")]);
    let (_, request) = &transport.sent()[0];
    assert_eq!(request.method, rsip::Method::Options);
    assert_eq!(
        drain(&mut h.events),
        vec![
            element_down("SG_DNS", "10.0.0.5"),
            RoutingEvent::ServerGroupDown {
                group: "SG_DNS".into()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn panicked_pipeline_is_restarted() {
    let group = monitored("SG1", &["10.0.0.1"], 0);
    let script = ScriptedTransport::new();
    script.reply(&key("10.0.0.1"), Reply::Status(200));
    let transport = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
        script: script.clone(),
    });
    let h = harness(vec![group], transport.clone(), StaticDns::new(), 8);

    h.monitor.reconcile();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(script.sent_keys(), vec![key("10.0.0.1")]);
    assert!(h.health.elements.is_up(&key("10.0.0.1")));
    assert_eq!(h.monitor.watched_groups(), vec!["SG1".to_string()]);
}

#[tokio::test]
async fn reconcile_follows_the_routing_snapshot() {
    let mut slow = policy(0);
    slow.up_interval = Duration::from_secs(3600);
    slow.down_interval = Duration::from_secs(3600);
    let probed = ServerGroup::builder("SG1")
        .element(ServerGroupElement::new("10.0.0.1", 5060, Transport::Udp, 1.0, 100, "SG1"))
        .ping_policy(slow)
        .build();
    let plain = static_group("SG2", &[("10.0.0.2", 1.0)]);
    let h = harness(vec![probed, plain.clone()], ScriptedTransport::new(), StaticDns::new(), 8);

    h.monitor.reconcile();
    assert_eq!(h.monitor.watched_groups(), vec!["SG1".to_string()]);

    h.routing.update(common::routing(vec![plain], vec![], &[503]));
    h.monitor.reconcile();
    assert!(h.monitor.watched_groups().is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_report_marks_unmonitored_groups_up() {
    let config = common::routing(
        vec![
            monitored("SG1", &["10.0.0.1"], 0),
            static_group("SG2", &[("10.0.0.2", 1.0)]),
        ],
        vec![trunk("carrier-a", TrunkKind::B2b, &[("SG1", 1.0), ("SG2", 0.5)])],
        &[503],
    );
    let engine = engine(config, ScriptedTransport::new(), StaticDns::new());
    engine.health().elements.set(&key("10.0.0.1"), false);
    engine.health().groups.set("SG1", false);
    engine.health().groups.set("SG2", false);
    let manager = Arc::new(TrunkManager::new(engine));

    let token = CancellationToken::new();
    let reporter = manager.spawn_status_reporter(Duration::from_secs(10), token.clone());
    tokio::time::sleep(Duration::from_millis(1)).await;

    let report = manager.health_report();
    assert_eq!(report.trunks.len(), 1);
    let trunk = &report.trunks[0];
    assert!(trunk.up);
    assert_eq!(trunk.key, "carrier-a");
    let sg1 = &trunk.groups[0];
    assert!(sg1.monitored && !sg1.up);
    assert!(!sg1.elements[0].up);
    let sg2 = &trunk.groups[1];
    assert!(!sg2.monitored && sg2.up);

    token.cancel();
    reporter.await.unwrap();
}
