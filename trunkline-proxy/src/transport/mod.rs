//! Outbound SIP transport.
//!
//! The routing engine and the health monitor only see [`SipTransport`]; a
//! transport error and a transport timeout are both an "attempt failed"
//! outcome for them.

mod udp;

pub use udp::UdpTransport;

use async_trait::async_trait;
use std::sync::Arc;

use trunkline_core::{EndPoint, Result};

/// Sends one request and waits for its final response.
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// Send `request` to `endpoint` and wait for the final (non-1xx) response.
    async fn send(&self, endpoint: &EndPoint, request: rsip::Request) -> Result<rsip::Response>;
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn SipTransport>;
