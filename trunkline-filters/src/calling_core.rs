//! Call-control cluster trunk normalization.

use trunkline_core::{EndPoint, Result, TrunkConfig};

use crate::b2b::B2bNormalizer;
use crate::sip;
use crate::TrunkNormalizer;

/// URI parameter carrying the trunk group towards the cluster.
pub const TRUNK_GROUP_PARAM: &str = "tgrp";

/// Normalizer for trunks facing a call-control cluster.
///
/// Behaves like [`B2bNormalizer`] and additionally tags the outbound
/// Request-URI with the trunk group. The cluster handles its own redirects,
/// so 3xx responses are returned rather than followed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallingCoreNormalizer {
    inner: B2bNormalizer,
}

impl TrunkNormalizer for CallingCoreNormalizer {
    fn normalize_ingress(&self, request: &mut rsip::Request, trunk: &TrunkConfig) -> Result<()> {
        self.inner.normalize_ingress(request, trunk)
    }

    fn normalize_egress(
        &self,
        request: &mut rsip::Request,
        endpoint: &EndPoint,
        trunk: &TrunkConfig,
    ) -> Result<()> {
        self.inner.normalize_egress(request, endpoint, trunk)?;
        sip::set_uri_param(request, TRUNK_GROUP_PARAM, trunk.lookup_key());
        Ok(())
    }

    fn enable_redirection(&self) -> bool {
        false
    }
}
