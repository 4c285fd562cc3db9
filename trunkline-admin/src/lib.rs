//! Trunkline Admin Control Plane
//!
//! Serves a line-delimited JSON protocol on a Unix socket. Each line is one
//! [`AdminRequest`]; each answer is one [`AdminResponse`] line. The proxy
//! plugs in through the [`ControlPlane`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trunkline_core::{CircuitState, Result};

/// Administrative override applied to one circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerAction {
    /// Reject every call until reset.
    ForceOpen,
    /// Let every call through and record nothing.
    Disable,
    /// Let every call through but keep recording.
    MetricsOnly,
    /// Back to closed with an empty window.
    Reset,
}

impl BreakerAction {
    /// State the breaker ends up in.
    pub fn target_state(&self) -> CircuitState {
        match self {
            BreakerAction::ForceOpen => CircuitState::ForcedOpen,
            BreakerAction::Disable => CircuitState::Disabled,
            BreakerAction::MetricsOnly => CircuitState::MetricsOnly,
            BreakerAction::Reset => CircuitState::Closed,
        }
    }
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum AdminRequest {
    /// Latest trunk health report.
    Status,
    /// Re-read the configuration file and swap it in.
    Reload,
    /// State of every cached circuit breaker.
    Breakers,
    /// Override one breaker.
    Breaker {
        /// Endpoint key (`host|port|transport`).
        key: String,
        /// What to do with it.
        action: BreakerAction,
    },
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Command output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdminResponse {
    /// Successful response.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// What the control socket can ask of a running proxy.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Latest health report as JSON.
    fn status(&self) -> serde_json::Value;

    /// Reload configuration; returns a short summary.
    async fn reload(&self) -> Result<serde_json::Value>;

    /// `(endpoint key, state)` of every cached breaker.
    fn breakers(&self) -> Vec<(String, CircuitState)>;

    /// Apply an override and return the resulting state.
    fn override_breaker(&self, key: &str, action: BreakerAction) -> Result<CircuitState>;
}

/// Execute one request.
pub async fn handle(control: &dyn ControlPlane, request: AdminRequest) -> AdminResponse {
    match request {
        AdminRequest::Status => AdminResponse::ok(control.status()),
        AdminRequest::Reload => match control.reload().await {
            Ok(summary) => AdminResponse::ok(summary),
            Err(e) => AdminResponse::error(e.to_string()),
        },
        AdminRequest::Breakers => AdminResponse::ok(serde_json::Value::Object(
            control
                .breakers()
                .into_iter()
                .map(|(key, state)| (key, serde_json::Value::from(state.as_str())))
                .collect(),
        )),
        AdminRequest::Breaker { key, action } => match control.override_breaker(&key, action) {
            Ok(state) => AdminResponse::ok(serde_json::json!({ "key": key, "state": state.as_str() })),
            Err(e) => AdminResponse::error(e.to_string()),
        },
    }
}

/// Parse and execute one request line.
pub async fn handle_line(control: &dyn ControlPlane, line: &str) -> AdminResponse {
    match serde_json::from_str::<AdminRequest>(line) {
        Ok(request) => handle(control, request).await,
        Err(e) => {
            warn!(error = %e, "malformed admin request");
            AdminResponse::error(format!("parse error: {e}"))
        }
    }
}

/// Serve the control socket at `path` until `token` is cancelled.
///
/// A stale socket file left by a previous run is replaced.
pub async fn serve(
    path: impl AsRef<Path>,
    control: Arc<dyn ControlPlane>,
    token: CancellationToken,
) -> std::io::Result<()> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let mut incoming = UnixListenerStream::new(UnixListener::bind(path)?);
    info!(socket = %path.display(), "admin control socket listening");

    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            next = incoming.next() => match next {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(error = %e, "admin accept failed");
                    continue;
                }
                None => break,
            },
        };
        let control = control.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, control.as_ref(), token).await {
                debug!(error = %e, "admin connection closed with error");
            }
        });
    }

    let _ = std::fs::remove_file(path);
    info!("admin control socket stopped");
    Ok(())
}

async fn serve_connection(
    stream: UnixStream,
    control: &dyn ControlPlane,
    token: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!(request = %line, "admin request");
        let response = handle_line(control, &line).await;
        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
