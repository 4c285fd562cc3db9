#![allow(dead_code)]

use async_trait::async_trait;
use rsip::prelude::UntypedHeader;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trunkline_core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EgressConfig, EgressGroupRef, EndPoint, Error,
    FailoverPolicies, FailoverPolicy, HealthState, IngressConfig, Result, RoutingConfig,
    RoutingTable, ServerGroup, ServerGroupElement, Transport, TrunkConfig, TrunkKind,
};
use trunkline_proxy::dns::{DnsLookup, DnsServerGroupResolver, Hop, LocateQuery};
use trunkline_proxy::{SipTransport, TrunkRoutingEngine};

/// What a scripted endpoint does with the next request it gets.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Redirect(u16, Vec<&'static str>),
    Fail(Error),
    Hang,
}

/// Transport answering from a per-endpoint script. Endpoints with nothing
/// left to say fail with a transport error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    sent: Mutex<Vec<(EndPoint, rsip::Request)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, key: &str, reply: Reply) -> &Self {
        self.script
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn sent_keys(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(e, _)| e.key()).collect()
    }

    pub fn sent(&self) -> Vec<(EndPoint, rsip::Request)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SipTransport for ScriptedTransport {
    async fn send(&self, endpoint: &EndPoint, request: rsip::Request) -> Result<rsip::Response> {
        self.sent.lock().unwrap().push((endpoint.clone(), request));
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&endpoint.key())
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Reply::Status(code)) => Ok(response(code, &endpoint.key(), &[])),
            Some(Reply::Redirect(code, contacts)) => Ok(response(code, &endpoint.key(), &contacts)),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(Error::transport(endpoint.key(), "connection refused")),
        }
    }
}

/// Response tagged with the endpoint that produced it.
pub fn response(code: u16, from: &str, contacts: &[&str]) -> rsip::Response {
    let mut headers: Vec<rsip::Header> = vec![
        rsip::headers::CallId::new("call-1@198.51.100.1").into(),
        rsip::Header::Other("X-Endpoint".into(), from.to_string()),
    ];
    for contact in contacts {
        headers.push(rsip::headers::Contact::new(*contact).into());
    }
    rsip::Response {
        status_code: rsip::StatusCode::from(code),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

/// Endpoint that produced a scripted response.
pub fn answered_by(response: &rsip::Response) -> Option<String> {
    response.headers.iter().find_map(|header| match header {
        rsip::Header::Other(name, value) if name == "X-Endpoint" => Some(value.clone()),
        _ => None,
    })
}

/// Lookup answering from a fixed table keyed by query name.
#[derive(Debug, Default)]
pub struct StaticDns {
    answers: Mutex<HashMap<String, Result<Vec<Hop>>>>,
    queries: Mutex<Vec<String>>,
}

impl StaticDns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, name: &str, answer: Result<Vec<Hop>>) -> &Self {
        self.answers.lock().unwrap().insert(name.to_string(), answer);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsLookup for StaticDns {
    async fn locate(&self, query: LocateQuery) -> Result<Vec<Hop>> {
        self.queries.lock().unwrap().push(query.name.clone());
        self.answers
            .lock()
            .unwrap()
            .get(&query.name)
            .cloned()
            .unwrap_or_else(|| Err(Error::dns(&query.name, "NXDOMAIN")))
    }
}

pub fn key(host: &str) -> String {
    format!("{host}|5060|udp")
}

pub fn static_group(name: &str, hosts: &[(&str, f32)]) -> ServerGroup {
    hosts
        .iter()
        .fold(ServerGroup::builder(name).network("net_sp"), |builder, (host, q)| {
            builder.element(ServerGroupElement::new(*host, 5060, Transport::Udp, *q, 100, name))
        })
        .build()
}

pub fn trunk(name: &str, kind: TrunkKind, groups: &[(&str, f32)]) -> TrunkConfig {
    TrunkConfig {
        name: name.into(),
        kind,
        ingress: IngressConfig {
            name: format!("{name}-in"),
            strip_params: vec!["dtg".into()],
        },
        egress: EgressConfig {
            server_groups: groups
                .iter()
                .map(|(group, priority)| EgressGroupRef::new(*group).ranked(*priority, 100))
                .collect(),
            response_timeout: Duration::from_secs(5),
            ..EgressConfig::default()
        },
    }
}

pub fn routing(groups: Vec<ServerGroup>, trunks: Vec<TrunkConfig>, codes: &[u16]) -> RoutingConfig {
    let failover = FailoverPolicies::new([FailoverPolicy::new("global", codes.iter().copied())]);
    RoutingConfig::new(groups, failover, trunks).unwrap()
}

pub fn engine(
    config: RoutingConfig,
    transport: Arc<ScriptedTransport>,
    dns: Arc<StaticDns>,
) -> TrunkRoutingEngine {
    TrunkRoutingEngine::new(
        Arc::new(RoutingTable::new(config)),
        Arc::new(HealthState::new()),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        transport,
        DnsServerGroupResolver::new(dns),
    )
}

pub fn invite(uri: &str) -> rsip::Request {
    let headers: Vec<rsip::Header> = vec![
        rsip::headers::Via::new("SIP/2.0/UDP 198.51.100.1:5060;branch=z9hG4bKtest1").into(),
        rsip::headers::CSeq::new("1 INVITE").into(),
        rsip::headers::From::new("Alice <sip:alice@example.com>;tag=a1").into(),
        rsip::headers::To::new("Bob <sip:bob@example.com>").into(),
        rsip::headers::CallId::new("call-1@198.51.100.1").into(),
        rsip::headers::MaxForwards::new("70").into(),
    ];
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from(uri).unwrap(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}
