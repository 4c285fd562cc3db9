//! OPTIONS liveness probes.

use rsip::prelude::UntypedHeader;
use std::sync::atomic::{AtomicU32, Ordering};

use trunkline_core::{EndPoint, Error, PingPolicy, Transport};
use trunkline_filters::sip;

use crate::transport::SipTransport;

static CSEQ: AtomicU32 = AtomicU32::new(1);

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered with a final response.
    Responded(u16),
    /// No usable answer: transport error or probe timeout.
    Failed(Error),
    /// The scheduler had no capacity; nothing was sent.
    Rejected,
}

impl ProbeResult {
    /// Whether the endpoint should be considered healthy under `policy`.
    /// `None` means the probe says nothing about the endpoint.
    pub fn verdict(&self, policy: &PingPolicy) -> Option<bool> {
        match self {
            ProbeResult::Responded(code) => Some(!policy.is_failure(*code)),
            ProbeResult::Failed(_) => Some(false),
            ProbeResult::Rejected => None,
        }
    }
}

/// Build the OPTIONS request for an endpoint.
///
/// The transport stamps its own topmost Via when sending.
pub fn options_request(endpoint: &EndPoint, policy: &PingPolicy) -> rsip::Request {
    let call_id = format!("{}@trunkline", uuid::Uuid::new_v4());
    let cseq = CSEQ.fetch_add(1, Ordering::Relaxed);
    let target = format!("sip:{}:{}", endpoint.host, endpoint.port);

    let headers: Vec<rsip::Header> = vec![
        rsip::headers::From::new(format!(
            "<sip:ping@trunkline>;tag={}",
            uuid::Uuid::new_v4().simple()
        ))
        .into(),
        rsip::headers::To::new(format!("<{target}>")).into(),
        rsip::headers::CallId::new(call_id).into(),
        rsip::headers::CSeq::new(format!("{cseq} OPTIONS")).into(),
        rsip::headers::MaxForwards::new(policy.max_forwards.to_string()).into(),
        rsip::headers::ContentLength::new("0").into(),
    ];

    let host_with_port =
        rsip::HostWithPort::try_from(format!("{}:{}", endpoint.host, endpoint.port).as_str())
            .unwrap_or_default();
    let mut uri = rsip::Uri {
        scheme: Some(rsip::Scheme::Sip),
        host_with_port,
        ..Default::default()
    };
    if endpoint.transport != Transport::Udp {
        uri.params
            .push(rsip::Param::Transport(sip::rsip_transport(endpoint.transport)));
    }

    rsip::Request {
        method: rsip::Method::Options,
        uri,
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

/// Send one probe, bounded by the policy timeout.
pub async fn send_probe(
    transport: &dyn SipTransport,
    endpoint: &EndPoint,
    policy: &PingPolicy,
) -> ProbeResult {
    let request = options_request(endpoint, policy);
    match tokio::time::timeout(policy.timeout, transport.send(endpoint, request)).await {
        Ok(Ok(response)) => ProbeResult::Responded(response.status_code.code()),
        Ok(Err(e)) => ProbeResult::Failed(e),
        Err(_) => ProbeResult::Failed(Error::timeout(
            format!("OPTIONS to {}", endpoint.key()),
            policy.timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::prelude::HeadersExt;

    #[test]
    fn request_carries_policy_max_forwards() {
        let policy = PingPolicy {
            max_forwards: 3,
            ..PingPolicy::default()
        };
        let endpoint = EndPoint::new("10.0.0.1", 5070, Transport::Udp, "SG1", "net");
        let request = options_request(&endpoint, &policy);

        assert_eq!(request.method, rsip::Method::Options);
        assert_eq!(sip::max_forwards(&request), Some(3));
        assert!(request.uri.to_string().contains("10.0.0.1:5070"));
        assert!(request.cseq_header().unwrap().value().ends_with("OPTIONS"));
    }

    #[test]
    fn verdict_follows_failure_codes() {
        let policy = PingPolicy::default();
        assert_eq!(ProbeResult::Responded(200).verdict(&policy), Some(true));
        assert_eq!(ProbeResult::Responded(404).verdict(&policy), Some(true));
        assert_eq!(ProbeResult::Responded(503).verdict(&policy), Some(false));
        assert_eq!(ProbeResult::Failed(Error::NoMoreEndpoints).verdict(&policy), Some(false));
        assert_eq!(ProbeResult::Rejected.verdict(&policy), None);
    }
}
