//! Admin socket bindings for a running proxy.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use trunkline_admin::{BreakerAction, ControlPlane};
use trunkline_core::{CircuitState, Error, Result};

use crate::config;
use crate::manager::TrunkManager;

/// [`ControlPlane`] backed by a [`TrunkManager`] and the file it was loaded
/// from.
#[derive(Debug, Clone)]
pub struct ProxyControl {
    manager: Arc<TrunkManager>,
    config_path: PathBuf,
}

impl ProxyControl {
    /// Bind the control plane to a manager.
    pub fn new(manager: Arc<TrunkManager>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            config_path: config_path.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for ProxyControl {
    fn status(&self) -> serde_json::Value {
        serde_json::to_value(self.manager.health_report().as_ref()).unwrap_or_default()
    }

    // Circuit breaker tuning and process settings are read once at startup;
    // a reload only swaps the routing snapshot.
    async fn reload(&self) -> Result<serde_json::Value> {
        let path = self.config_path.clone();
        let loaded = tokio::task::spawn_blocking(move || config::load(path))
            .await
            .map_err(|e| Error::config(format!("reload task failed: {e}")))?
            .inspect_err(|e| warn!(error = %e, "configuration reload rejected"))?;

        let trunks = loaded.routing.trunks().len();
        let groups = loaded.routing.server_groups().count();
        self.manager.reconfigure(loaded.routing);
        info!(path = %self.config_path.display(), "configuration reloaded");
        Ok(serde_json::json!({ "trunks": trunks, "server_groups": groups }))
    }

    fn breakers(&self) -> Vec<(String, CircuitState)> {
        self.manager.engine().breakers().states()
    }

    fn override_breaker(&self, key: &str, action: BreakerAction) -> Result<CircuitState> {
        if key.is_empty() {
            return Err(Error::InvalidRequest("empty breaker key".into()));
        }
        let breakers = self.manager.engine().breakers();
        match action {
            BreakerAction::Reset => breakers.reset(key),
            other => breakers.transition(key, other.target_state()),
        }
        info!(endpoint = key, action = ?action, "circuit breaker overridden");
        Ok(breakers.state(key).unwrap_or(action.target_state()))
    }
}
