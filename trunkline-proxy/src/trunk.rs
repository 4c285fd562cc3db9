//! A configured trunk bound to its normalizer.

use std::sync::Arc;

use trunkline_core::{Result, TrunkConfig, TrunkKind};
use trunkline_filters::{normalizer_for, TrunkNormalizer};

/// A trunk ready for routing.
#[derive(Debug, Clone)]
pub struct Trunk {
    config: Arc<TrunkConfig>,
    normalizer: Arc<dyn TrunkNormalizer>,
}

impl Trunk {
    /// Bind a trunk to the normalizer of its kind.
    pub fn new(config: Arc<TrunkConfig>) -> Self {
        let normalizer = normalizer_for(config.kind);
        Self { config, normalizer }
    }

    /// Trunk configuration.
    pub fn config(&self) -> &TrunkConfig {
        &self.config
    }

    /// Trunk name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Trunk kind.
    pub fn kind(&self) -> TrunkKind {
        self.config.kind
    }

    /// Normalization hooks.
    pub fn normalizer(&self) -> &dyn TrunkNormalizer {
        self.normalizer.as_ref()
    }

    /// Apply ingress normalization in place.
    pub fn normalize_ingress(&self, request: &mut rsip::Request) -> Result<()> {
        self.normalizer.normalize_ingress(request, &self.config)
    }
}
