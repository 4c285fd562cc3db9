use async_trait::async_trait;
use dashmap::DashMap;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use trunkline_core::{EndPoint, Error, Result, Transport};

use super::SipTransport;

const MAX_DATAGRAM: usize = 65_535;

struct UdpTransportInner {
    conn: UdpSocket,
    local: SocketAddr,
    timeout: Duration,
    /// Waiting senders keyed by the branch of the Via we stamped.
    pending: DashMap<String, oneshot::Sender<rsip::Response>>,
}

/// Removes a send's pending entry however the send ends, including when the
/// caller drops the future.
struct PendingSend<'a> {
    pending: &'a DashMap<String, oneshot::Sender<rsip::Response>>,
    branch: String,
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.branch);
    }
}

/// Connectionless SIP transport over a single UDP socket.
///
/// Every send stamps a fresh Via branch and responses are matched on the
/// branch of their topmost Via, so a late answer from one destination never
/// completes a send to another. Provisional responses are dropped; the first
/// final response completes the send.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

impl UdpTransport {
    /// Bind the socket. Call [`UdpTransport::serve_loop`] to start receiving.
    pub async fn bind(local: SocketAddr, timeout: Duration) -> Result<Self> {
        let conn = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::transport(local.to_string(), e.to_string()))?;
        let local = conn
            .local_addr()
            .map_err(|e| Error::transport(local.to_string(), e.to_string()))?;

        info!(%local, timeout_ms = timeout.as_millis() as u64, "created UDP transport");
        Ok(Self {
            inner: Arc::new(UdpTransportInner {
                conn,
                local,
                timeout,
                pending: DashMap::new(),
            }),
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Receive datagrams and complete matching sends until cancelled.
    pub async fn serve_loop(&self, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = token.cancelled() => break,
                received = self.inner.conn.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "error receiving UDP datagram");
                        continue;
                    }
                },
            };

            let text = match std::str::from_utf8(&buf[..len]) {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => continue,
                Err(e) => {
                    debug!(%from, error = %e, "dropping non UTF-8 datagram");
                    continue;
                }
            };

            let response = match rsip::SipMessage::try_from(text) {
                Ok(rsip::SipMessage::Response(response)) => response,
                Ok(rsip::SipMessage::Request(request)) => {
                    trace!(%from, method = %request.method, "ignoring request on egress socket");
                    continue;
                }
                Err(e) => {
                    debug!(%from, error = %e, "dropping unparsable datagram");
                    continue;
                }
            };

            if response.status_code.code() < 200 {
                continue;
            }
            let Some(branch) = via_branch(&response) else {
                debug!(%from, "response without a Via branch");
                continue;
            };
            match self.inner.pending.remove(&branch) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response);
                }
                None => trace!(%from, %branch, "late or unsolicited response"),
            }
        }
        info!(local = %self.inner.local, "UDP transport stopped");
    }

    async fn target(endpoint: &EndPoint) -> Result<SocketAddr> {
        tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| Error::transport(endpoint.key(), e.to_string()))?
            .next()
            .ok_or_else(|| Error::transport(endpoint.key(), "host has no address"))
    }

    /// Stamp our Via on top and return its branch.
    fn push_via(&self, request: &mut rsip::Request) -> String {
        let branch = format!("z9hG4bK{}", uuid::Uuid::new_v4().simple());
        let via = rsip::headers::Via::new(format!(
            "SIP/2.0/UDP {};branch={branch}",
            self.inner.local
        ));
        let mut headers: Vec<rsip::Header> = vec![via.into()];
        headers.extend(request.headers.iter().cloned());
        request.headers = headers.into();
        branch
    }
}

#[async_trait]
impl SipTransport for UdpTransport {
    #[instrument(skip(self, request), fields(endpoint = %endpoint))]
    async fn send(&self, endpoint: &EndPoint, mut request: rsip::Request) -> Result<rsip::Response> {
        if endpoint.transport != Transport::Udp {
            return Err(Error::transport(
                endpoint.key(),
                format!("no {} transport available", endpoint.transport),
            ));
        }
        if request.call_id_header().is_err() || request.cseq_header().is_err() {
            return Err(Error::InvalidRequest("missing Call-ID or CSeq".to_string()));
        }
        let target = Self::target(endpoint).await?;

        let branch = self.push_via(&mut request);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(branch.clone(), tx);
        let _pending = PendingSend {
            pending: &self.inner.pending,
            branch,
        };

        let buf = request.to_string();
        trace!(len = buf.len(), %target, "sending request");
        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| Error::transport(endpoint.key(), e.to_string()))?;

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::transport(endpoint.key(), "transport shut down")),
            Err(_) => Err(Error::timeout(
                format!("send to {}", endpoint.key()),
                self.inner.timeout,
            )),
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.inner.local)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

fn via_branch<M: HeadersExt>(message: &M) -> Option<String> {
    let via = message.via_header().ok()?.typed().ok()?;
    via.branch().map(|branch| branch.to_string())
}
