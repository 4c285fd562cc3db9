//! Destination endpoint models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The transport a destination is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transport {
    /// SIP over UDP.
    Udp,
    /// SIP over TCP.
    Tcp,
    /// SIP over TLS.
    Tls,
}

impl Transport {
    /// Lower-case name used in cache keys and URI parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }

    /// Default port for the transport when a destination omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls => 5061,
            _ => 5060,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }
}

impl TryFrom<String> for Transport {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Transport> for String {
    fn from(transport: Transport) -> Self {
        transport.as_str().to_string()
    }
}

/// A concrete destination handed to the transport layer.
///
/// Immutable once built. The [`EndPoint::key`] string doubles as the key for
/// the circuit breaker registry and the element status table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    /// Destination host name or IP literal.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Transport to send over.
    pub transport: Transport,
    /// Name of the server group the destination was picked from.
    pub server_group: String,
    /// Network (interface) the request leaves through.
    pub network: String,
}

impl EndPoint {
    /// Create a new endpoint.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        transport: Transport,
        server_group: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            server_group: server_group.into(),
            network: network.into(),
        }
    }

    /// Cache key in the `host|port|transport` form.
    pub fn key(&self) -> String {
        endpoint_key(&self.host, self.port, self.transport)
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{};transport={}", self.host, self.port, self.transport)
    }
}

/// Build the `host|port|transport` key without allocating an [`EndPoint`].
pub fn endpoint_key(host: &str, port: u16, transport: Transport) -> String {
    format!("{}|{}|{}", host, port, transport)
}
