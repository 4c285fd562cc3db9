//! Request rewriting helpers shared by every normalizer.

use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Param, Request};

use trunkline_core::{EndPoint, Error, Result, Transport};

/// Max-Forwards value used when the request carries none.
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// The request's Call-ID, required for routing affinity.
pub fn call_id(request: &Request) -> Result<String> {
    request
        .call_id_header()
        .map(|h| h.value().to_string())
        .map_err(|_| Error::InvalidRequest("missing Call-ID header".to_string()))
}

/// Remove Request-URI parameters whose name matches one of `names`
/// (case-insensitive).
pub fn strip_uri_params(request: &mut Request, names: &[String]) {
    if names.is_empty() {
        return;
    }
    request.uri.params.retain(|param| match param {
        Param::Other(name, _) => !names
            .iter()
            .any(|strip| name.value().eq_ignore_ascii_case(strip)),
        _ => true,
    });
}

/// Current Max-Forwards value, if the header is present and numeric.
pub fn max_forwards(request: &Request) -> Option<u32> {
    request.headers.iter().find_map(|header| match header {
        Header::MaxForwards(value) => value.value().trim().parse().ok(),
        _ => None,
    })
}

/// Decrement Max-Forwards, inserting the default when absent.
///
/// A request that arrives with Max-Forwards 0 must not be forwarded.
pub fn decrement_max_forwards(request: &mut Request) -> Result<u32> {
    let current = max_forwards(request).unwrap_or(DEFAULT_MAX_FORWARDS);
    if current == 0 {
        return Err(Error::InvalidRequest("Max-Forwards exhausted".to_string()));
    }
    let next = current - 1;
    let mut headers: Vec<Header> = request
        .headers
        .iter()
        .filter(|h| !matches!(h, Header::MaxForwards(_)))
        .cloned()
        .collect();
    headers.push(rsip::headers::MaxForwards::new(next.to_string()).into());
    request.headers = headers.into();
    Ok(next)
}

/// Map a Trunkline transport to the `rsip` one.
pub fn rsip_transport(transport: Transport) -> rsip::transport::Transport {
    match transport {
        Transport::Udp => rsip::transport::Transport::Udp,
        Transport::Tcp => rsip::transport::Transport::Tcp,
        Transport::Tls => rsip::transport::Transport::Tls,
    }
}

/// Map an `rsip` transport back, rejecting ones the engine does not route over.
pub fn from_rsip_transport(transport: &rsip::transport::Transport) -> Result<Transport> {
    match transport {
        rsip::transport::Transport::Udp => Ok(Transport::Udp),
        rsip::transport::Transport::Tcp => Ok(Transport::Tcp),
        rsip::transport::Transport::Tls => Ok(Transport::Tls),
        other => Err(Error::UnsupportedTransport(other.to_string())),
    }
}

/// Point the Request-URI at the chosen endpoint.
///
/// Host and port are replaced and the `transport` parameter is rewritten;
/// the user part and every other parameter are preserved.
pub fn set_request_target(request: &mut Request, endpoint: &EndPoint) -> Result<()> {
    let host_with_port = rsip::HostWithPort::try_from(format!("{}:{}", endpoint.host, endpoint.port).as_str())
        .map_err(|e| Error::InvalidRequest(format!("bad destination {endpoint}: {e}")))?;
    request.uri.host_with_port = host_with_port;
    request
        .uri
        .params
        .retain(|param| !matches!(param, Param::Transport(_)));
    if endpoint.transport != Transport::Udp {
        request
            .uri
            .params
            .push(Param::Transport(rsip_transport(endpoint.transport)));
    }
    Ok(())
}

/// Set (or replace) a Request-URI parameter.
pub fn set_uri_param(request: &mut Request, name: &str, value: &str) {
    request.uri.params.retain(|param| match param {
        Param::Other(existing, _) => !existing.value().eq_ignore_ascii_case(name),
        _ => true,
    });
    request.uri.params.push(Param::Other(
        rsip::param::OtherParam::new(name),
        Some(rsip::param::OtherParamValue::new(value.to_string())),
    ));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsip::headers::*;

    pub(crate) fn invite(uri: &str, max_forwards: Option<&str>) -> Request {
        let mut headers: Vec<Header> = vec![
            Via::new("SIP/2.0/UDP 198.51.100.1:5060;branch=z9hG4bKtrunk1").into(),
            CSeq::new("1 INVITE").into(),
            From::new("Alice <sip:alice@example.com>;tag=a1").into(),
            To::new("Bob <sip:bob@example.com>").into(),
            CallId::new("call-1@198.51.100.1").into(),
        ];
        if let Some(mf) = max_forwards {
            headers.push(MaxForwards::new(mf).into());
        }
        Request {
            method: rsip::Method::Invite,
            uri: rsip::Uri::try_from(uri).unwrap(),
            version: rsip::Version::V2,
            headers: headers.into(),
            body: vec![],
        }
    }

    #[test]
    fn rewrites_host_port_and_transport() {
        let mut request = invite("sip:+15551234@carrier.example.com;transport=udp;dtg=A", Some("70"));
        let endpoint = EndPoint::new("10.0.0.7", 5080, Transport::Tcp, "SG1", "net_sp");

        set_request_target(&mut request, &endpoint).unwrap();

        let uri = request.uri.to_string();
        assert!(uri.contains("+15551234@10.0.0.7:5080"), "{uri}");
        assert!(uri.contains("transport=TCP") || uri.contains("transport=tcp"), "{uri}");
        assert!(uri.contains("dtg=A"), "{uri}");
    }

    #[test]
    fn strips_named_params_only() {
        let mut request = invite("sip:bob@example.com;dtg=A;sbc=x;user=phone", None);
        strip_uri_params(&mut request, &["DTG".to_string(), "sbc".to_string()]);
        let uri = request.uri.to_string();
        assert!(!uri.contains("dtg"), "{uri}");
        assert!(!uri.contains("sbc"), "{uri}");
    }

    #[test]
    fn max_forwards_is_decremented_or_defaulted() {
        let mut request = invite("sip:bob@example.com", Some("5"));
        assert_eq!(decrement_max_forwards(&mut request).unwrap(), 4);
        assert_eq!(max_forwards(&request), Some(4));

        let mut request = invite("sip:bob@example.com", None);
        assert_eq!(decrement_max_forwards(&mut request).unwrap(), 69);

        let mut request = invite("sip:bob@example.com", Some("0"));
        assert!(matches!(
            decrement_max_forwards(&mut request),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn reads_call_id() {
        let request = invite("sip:bob@example.com", None);
        assert_eq!(call_id(&request).unwrap(), "call-1@198.51.100.1");
    }
}
