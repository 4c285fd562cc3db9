//! Domain models: destinations, groups, policies, trunks and shared status.

pub mod element;
pub mod endpoint;
pub mod failover;
pub mod routing;
pub mod server_group;
pub mod status;
pub mod trunk;
