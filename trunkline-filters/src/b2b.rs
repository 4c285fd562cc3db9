//! Peering (B2B) trunk normalization.

use tracing::trace;

use trunkline_core::{EndPoint, Result, TrunkConfig};

use crate::sip;
use crate::TrunkNormalizer;

/// Normalizer for peering trunks.
///
/// Ingress validates the request, strips the trunk's configured Request-URI
/// parameters and decrements Max-Forwards. Egress points the Request-URI at
/// the chosen endpoint. Redirects are followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct B2bNormalizer;

impl TrunkNormalizer for B2bNormalizer {
    fn normalize_ingress(&self, request: &mut rsip::Request, trunk: &TrunkConfig) -> Result<()> {
        sip::call_id(request)?;
        sip::strip_uri_params(request, &trunk.ingress.strip_params);
        let hops = sip::decrement_max_forwards(request)?;
        trace!(trunk = %trunk.name, max_forwards = hops, "ingress normalized");
        Ok(())
    }

    fn normalize_egress(
        &self,
        request: &mut rsip::Request,
        endpoint: &EndPoint,
        _trunk: &TrunkConfig,
    ) -> Result<()> {
        sip::set_request_target(request, endpoint)
    }

    fn enable_redirection(&self) -> bool {
        true
    }
}
