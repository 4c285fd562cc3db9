//! Error taxonomy shared by every Trunkline crate.
//!
//! Routing distinguishes three classes of failure: conditions that advance the
//! routing loop to the next candidate, the exhausted condition, and fatal
//! conditions that are surfaced immediately without consuming attempts.

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced while routing a request or probing a destination.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport failed to deliver the request or produce a response.
    #[error("transport error towards {endpoint}: {reason}")]
    Transport {
        /// Endpoint key the request was sent to.
        endpoint: String,
        /// Human readable failure cause.
        reason: String,
    },

    /// A single send, or the whole routing loop, ran out of time.
    #[error("operation timed out: {operation} after {duration_ms}ms")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// How long we waited.
        duration_ms: u64,
    },

    /// DNS lookup returned no usable hops or failed outright.
    #[error("dns resolution failed for {host}: {reason}")]
    Dns {
        /// Queried host name.
        host: String,
        /// Failure cause reported by the lookup service.
        reason: String,
    },

    /// The circuit breaker for the endpoint refused the call.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Every candidate was tried and no response worth returning was seen.
    #[error("no more endpoints to try")]
    NoMoreEndpoints,

    /// The request cannot be routed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No trunk is registered under the requested kind and key.
    #[error("no trunk registered for {kind} with key '{key}'")]
    UnknownTrunk {
        /// Trunk kind that was requested.
        kind: String,
        /// Selector key that was requested.
        key: String,
    },

    /// A transport name that the engine cannot route over.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new transport error.
    pub fn transport<E: Into<String>, R: Into<String>>(endpoint: E, reason: R) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a new DNS error.
    pub fn dns<H: Into<String>, R: Into<String>>(host: H, reason: R) -> Self {
        Self::Dns {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Whether the routing loop should move on to the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::Timeout { .. }
                | Error::Dns { .. }
                | Error::CircuitOpen(_)
        )
    }

    /// Whether the error must be returned to the caller without further attempts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::UnknownTrunk { .. }
                | Error::UnsupportedTransport(_)
                | Error::Config(_)
        )
    }
}
