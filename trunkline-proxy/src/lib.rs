//! Trunkline Proxy Engine
//!
//! The async half of Trunkline: the trunk routing engine, the OPTIONS health
//! monitor, DNS-backed server groups, the UDP transport and the trunk
//! registry that ties them together.

pub mod config;
pub mod control;
pub mod dns;
pub mod engine;
pub mod events;
pub mod health_check;
pub mod manager;
pub mod transport;
pub mod trunk;

pub use control::ProxyControl;
pub use engine::{default_failure_predicate, FailurePredicate, TrunkRoutingEngine};
pub use events::{EventBus, RoutingEvent};
pub use health_check::OptionsPingMonitor;
pub use manager::{HealthReport, TrunkManager};
pub use transport::{SharedTransport, SipTransport, UdpTransport};
pub use trunk::Trunk;
