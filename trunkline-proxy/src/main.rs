//! Trunkline proxy binary.
//!
//! Loads the configuration file, starts the UDP transport, the probe runtime
//! and the admin socket, and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trunkline_core::{CircuitBreakerRegistry, HealthState, RoutingTable};
use trunkline_proxy::config;
use trunkline_proxy::dns::{DnsServerGroupResolver, SystemLookup};
use trunkline_proxy::{
    EventBus, OptionsPingMonitor, ProxyControl, TrunkManager, TrunkRoutingEngine, UdpTransport,
};

/// SIP trunk routing and resilience engine.
#[derive(Debug, Parser)]
#[command(name = "trunkline", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "trunkline.toml")]
    config: PathBuf,

    /// Control socket path; overrides `proxy.admin_socket`
    #[arg(long)]
    admin_socket: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let loaded = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let settings = loaded.proxy.clone();
    info!(
        config = %args.config.display(),
        trunks = loaded.routing.trunks().len(),
        "starting trunkline"
    );

    // Probes get their own threads so a probe storm never delays routing.
    let probe_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.probe_worker_threads.max(1))
        .thread_name("health-probe")
        .enable_all()
        .build()
        .context("building probe runtime")?;

    let token = CancellationToken::new();
    let events = EventBus::default();
    let breakers = Arc::new(
        CircuitBreakerRegistry::new(loaded.circuit_breaker).with_listener(events.breaker_listener()),
    );
    let routing = Arc::new(RoutingTable::new(loaded.routing));
    let health = Arc::new(HealthState::new());

    let udp = UdpTransport::bind(settings.bind, settings.transport_timeout()).await?;
    let receiver = {
        let udp = udp.clone();
        let token = token.clone();
        tokio::spawn(async move { udp.serve_loop(token).await })
    };
    let transport = Arc::new(udp);
    let resolver = DnsServerGroupResolver::new(Arc::new(SystemLookup));

    let engine = TrunkRoutingEngine::new(
        routing.clone(),
        health.clone(),
        breakers,
        transport.clone(),
        resolver.clone(),
    );
    let monitor = Arc::new(OptionsPingMonitor::new(
        routing,
        health,
        transport,
        resolver,
        events,
        probe_runtime.handle().clone(),
        settings.max_concurrent_probes,
    ));
    let manager = Arc::new(TrunkManager::new(engine).with_monitor(monitor.clone()));
    let reporter = manager.spawn_status_reporter(settings.status_report_interval(), token.clone());

    let admin_socket = args
        .admin_socket
        .or_else(|| settings.admin_socket.as_ref().map(PathBuf::from));
    let admin = admin_socket.map(|path| {
        let control = Arc::new(ProxyControl::new(manager.clone(), args.config.clone()));
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = trunkline_admin::serve(&path, control, token).await {
                error!(socket = %path.display(), error = %e, "admin socket failed");
            }
        })
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    token.cancel();
    monitor.shutdown();
    let _ = receiver.await;
    let _ = reporter.await;
    if let Some(admin) = admin {
        let _ = admin.await;
    }
    probe_runtime.shutdown_background();
    Ok(())
}
