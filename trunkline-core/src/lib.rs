//! Trunkline Core functionality.
//!
//! This crate contains the domain models, routing snapshot, load balancers and
//! circuit breakers that power the Trunkline SIP trunk router. Nothing in here
//! performs I/O; the async engine and health monitor live in `trunkline-proxy`.

pub mod circuit_breaker;
pub mod domain;
pub mod error;
pub mod load_balancer;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, Decision, Outcome, Permit,
};
pub use domain::element::{Provenance, ServerGroupElement};
pub use domain::endpoint::{EndPoint, Transport};
pub use domain::failover::{FailoverPolicies, FailoverPolicy, GLOBAL_POLICY};
pub use domain::routing::{RoutingConfig, RoutingTable, SharedRoutingTable};
pub use domain::server_group::{GroupKind, LbType, PingPolicy, ServerGroup};
pub use domain::status::{HealthState, SharedHealthState, StatusTable};
pub use domain::trunk::{EgressConfig, EgressGroupRef, IngressConfig, TrunkConfig, TrunkKind};
pub use error::{Error, Result};
pub use load_balancer::{Candidate, LoadBalancer};
