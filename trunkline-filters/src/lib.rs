//! Trunkline Trunk Filters
//!
//! Ingress and egress normalization applied around the shared routing engine.
//! Each trunk kind provides one [`TrunkNormalizer`]; the engine itself never
//! branches on the kind.

pub mod b2b;
pub mod calling_core;
pub mod sip;

use std::fmt::Debug;
use std::sync::Arc;

use trunkline_core::{EndPoint, Result, TrunkConfig, TrunkKind};

pub use b2b::B2bNormalizer;
pub use calling_core::CallingCoreNormalizer;

/// The per-kind hooks a trunk plugs into the routing engine.
pub trait TrunkNormalizer: Debug + Send + Sync {
    /// Rewrite an inbound request before routing. Errors are fatal.
    fn normalize_ingress(&self, request: &mut rsip::Request, trunk: &TrunkConfig) -> Result<()>;

    /// Rewrite the outbound copy of a request once a destination is chosen.
    fn normalize_egress(
        &self,
        request: &mut rsip::Request,
        endpoint: &EndPoint,
        trunk: &TrunkConfig,
    ) -> Result<()>;

    /// Whether 3xx responses are followed instead of returned.
    fn enable_redirection(&self) -> bool;
}

/// The normalizer for a trunk kind.
pub fn normalizer_for(kind: TrunkKind) -> Arc<dyn TrunkNormalizer> {
    match kind {
        TrunkKind::B2b => Arc::new(B2bNormalizer),
        TrunkKind::CallingCore => Arc::new(CallingCoreNormalizer::default()),
    }
}
