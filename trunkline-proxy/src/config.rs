//! # Configuration File
//!
//! Loads the TOML file that describes server groups, failover and ping
//! policies, trunks and circuit breaker tuning, and turns it into the core
//! routing types.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use trunkline_core::{
    CircuitBreakerConfig, EgressConfig, EgressGroupRef, Error, FailoverPolicies, FailoverPolicy,
    IngressConfig, LbType, PingPolicy, Result, RoutingConfig, ServerGroup, ServerGroupElement,
    Transport, TrunkConfig, TrunkKind,
};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Process settings
    pub proxy: ProxySettings,
    /// Circuit breaker tuning
    pub circuit_breaker: CircuitBreakerSettings,
    /// Failover policies
    pub failover_policies: Vec<FailoverPolicySettings>,
    /// Ping policies
    pub ping_policies: Vec<PingPolicySettings>,
    /// Server groups
    pub server_groups: Vec<ServerGroupSettings>,
    /// Trunks
    pub trunks: Vec<TrunkSettings>,
}

/// Process level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySettings {
    /// Local address of the egress UDP socket
    pub bind: SocketAddr,
    /// Per-send transport timeout in milliseconds
    pub transport_timeout_ms: u64,
    /// Probes allowed in flight at once
    pub max_concurrent_probes: usize,
    /// Worker threads of the probe runtime
    pub probe_worker_threads: usize,
    /// Status report period in milliseconds
    pub status_report_interval_ms: u64,
    /// Control socket path
    pub admin_socket: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            transport_timeout_ms: 4_000,
            max_concurrent_probes: 256,
            probe_worker_threads: 2,
            status_report_interval_ms: 10_000,
            admin_socket: None,
        }
    }
}

impl ProxySettings {
    /// Per-send transport timeout
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    /// Status report period
    pub fn status_report_interval(&self) -> Duration {
        Duration::from_millis(self.status_report_interval_ms)
    }
}

/// Circuit breaker tuning as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    /// Calls kept in the sliding window
    pub sliding_window_size: usize,
    /// Calls needed before the failure rate is evaluated
    pub minimum_number_of_calls: Option<usize>,
    /// Failure rate in percent that opens the circuit
    pub failure_rate_threshold: f32,
    /// Open state duration in milliseconds
    pub wait_duration_in_open_state_ms: u64,
    /// Concurrent half-open probe calls
    pub permitted_half_open_calls: u32,
    /// Maximum cached breakers
    pub max_breakers: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            sliding_window_size: defaults.sliding_window_size,
            minimum_number_of_calls: defaults.minimum_number_of_calls,
            failure_rate_threshold: defaults.failure_rate_threshold,
            wait_duration_in_open_state_ms: defaults.wait_duration_in_open_state.as_millis() as u64,
            permitted_half_open_calls: defaults.permitted_half_open_calls,
            max_breakers: defaults.max_breakers,
        }
    }
}

impl CircuitBreakerSettings {
    /// Convert into the registry configuration.
    pub fn to_config(&self) -> Result<CircuitBreakerConfig> {
        if self.sliding_window_size == 0 {
            return Err(Error::config("circuit_breaker.sliding_window_size must be positive"));
        }
        if !(0.0..=100.0).contains(&self.failure_rate_threshold) || self.failure_rate_threshold == 0.0 {
            return Err(Error::config(
                "circuit_breaker.failure_rate_threshold must be in (0, 100]",
            ));
        }
        if self.permitted_half_open_calls == 0 {
            return Err(Error::config(
                "circuit_breaker.permitted_half_open_calls must be positive",
            ));
        }
        Ok(CircuitBreakerConfig {
            sliding_window_size: self.sliding_window_size,
            minimum_number_of_calls: self.minimum_number_of_calls,
            failure_rate_threshold: self.failure_rate_threshold,
            wait_duration_in_open_state: Duration::from_millis(self.wait_duration_in_open_state_ms),
            permitted_half_open_calls: self.permitted_half_open_calls,
            max_breakers: self.max_breakers.max(1),
        })
    }
}

/// `[[failover_policies]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverPolicySettings {
    /// Policy name
    pub name: String,
    /// Codes that fail over
    pub codes: Vec<u16>,
    /// Code carrying a Retry-After from the destination
    #[serde(default)]
    pub retry_after: Option<u16>,
}

/// `[[ping_policies]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PingPolicySettings {
    /// Policy name
    pub name: String,
    /// Probe period for live elements in milliseconds
    pub up_interval_ms: u64,
    /// Probe period for dead elements in milliseconds
    pub down_interval_ms: u64,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
    /// Codes that count as a failed probe
    #[serde(default = "default_failure_codes")]
    pub failure_codes: Vec<u16>,
    /// Extra attempts of the up-pipeline
    #[serde(default)]
    pub retries: u32,
    /// Pause between retries in milliseconds
    #[serde(default)]
    pub retry_delay_ms: u64,
    /// Max-Forwards of the probe
    #[serde(default = "default_max_forwards")]
    pub max_forwards: u8,
}

fn default_failure_codes() -> Vec<u16> {
    PingPolicy::default().failure_codes.into_iter().collect()
}

fn default_max_forwards() -> u8 {
    PingPolicy::default().max_forwards
}

impl PingPolicySettings {
    fn to_policy(&self) -> Result<PingPolicy> {
        for (field, value) in [
            ("up_interval_ms", self.up_interval_ms),
            ("down_interval_ms", self.down_interval_ms),
            ("timeout_ms", self.timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::config(format!(
                    "ping policy '{}': {field} must be positive",
                    self.name
                )));
            }
        }
        Ok(PingPolicy {
            name: self.name.clone(),
            up_interval: Duration::from_millis(self.up_interval_ms),
            down_interval: Duration::from_millis(self.down_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            failure_codes: self.failure_codes.iter().copied().collect(),
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_forwards: self.max_forwards,
        })
    }
}

/// `[[server_groups.elements]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementSettings {
    /// Host name or IP literal
    pub host: String,
    /// Port; defaults to the transport's default port
    #[serde(default)]
    pub port: Option<u16>,
    /// Transport; defaults to the group's
    #[serde(default)]
    pub transport: Option<String>,
    /// Rank in [0, 1]
    #[serde(default = "default_q_value")]
    pub q_value: f32,
    /// Weight among equal ranks
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_q_value() -> f32 {
    1.0
}

fn default_weight() -> u32 {
    100
}

/// `[[server_groups]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerGroupSettings {
    /// Unique name
    pub name: String,
    /// Network the group is reached through
    #[serde(default = "default_network")]
    pub network: String,
    /// Load balancing within a rank tier
    #[serde(default)]
    pub lb_type: LbType,
    /// Transport for DNS lookups and elements without their own
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Failover policy name
    #[serde(default = "default_failover_policy")]
    pub failover_policy: String,
    /// Ping policy name; probing is off without one
    #[serde(default)]
    pub ping_policy: Option<String>,
    /// DNS host; makes the group dynamic
    #[serde(default)]
    pub dns_host: Option<String>,
    /// Port for A-record answers of a DNS group
    #[serde(default)]
    pub dns_port: Option<u16>,
    /// Static elements
    #[serde(default)]
    pub elements: Vec<ElementSettings>,
}

fn default_network() -> String {
    "default".to_string()
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_failover_policy() -> String {
    trunkline_core::GLOBAL_POLICY.to_string()
}

/// `[[trunks.egress]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EgressGroupSettings {
    /// Server group name
    pub server_group: String,
    /// Rank among the trunk's groups
    #[serde(default = "default_q_value")]
    pub priority: f32,
    /// Weight among equal priorities
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// `[[trunks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrunkSettings {
    /// Trunk name
    pub name: String,
    /// `b2b` or `calling-core`
    pub kind: TrunkKind,
    /// Ingress name; defaults to the trunk name
    #[serde(default)]
    pub ingress: Option<String>,
    /// Request-URI parameters stripped on ingress
    #[serde(default)]
    pub strip_params: Vec<String>,
    /// Load balancing across the trunk's groups
    #[serde(default)]
    pub lb_type: LbType,
    /// Overall response timeout in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Selector key; defaults to the trunk name
    #[serde(default)]
    pub selector: Option<String>,
    /// Attached server groups
    #[serde(default)]
    pub egress: Vec<EgressGroupSettings>,
}

fn default_response_timeout_ms() -> u64 {
    EgressConfig::default().response_timeout.as_millis() as u64
}

/// Everything a running proxy needs from the file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Process settings
    pub proxy: ProxySettings,
    /// Circuit breaker registry configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Validated routing snapshot
    pub routing: RoutingConfig,
}

impl FileConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Read and parse a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Validate and convert into the runtime types.
    pub fn build(&self) -> Result<LoadedConfig> {
        if self.proxy.transport_timeout_ms == 0 {
            return Err(Error::config("proxy.transport_timeout_ms must be positive"));
        }
        if self.proxy.status_report_interval_ms == 0 {
            return Err(Error::config("proxy.status_report_interval_ms must be positive"));
        }

        let mut names = HashSet::new();
        for policy in &self.failover_policies {
            if !names.insert(policy.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate failover policy '{}'",
                    policy.name
                )));
            }
        }
        let failover = FailoverPolicies::new(self.failover_policies.iter().map(|p| {
            let policy = FailoverPolicy::new(p.name.clone(), p.codes.iter().copied());
            match p.retry_after {
                Some(code) => policy.with_retry_after(code),
                None => policy,
            }
        }));

        let mut ping = HashMap::new();
        for settings in &self.ping_policies {
            if ping
                .insert(settings.name.clone(), settings.to_policy()?)
                .is_some()
            {
                return Err(Error::config(format!(
                    "duplicate ping policy '{}'",
                    settings.name
                )));
            }
        }

        let groups = self
            .server_groups
            .iter()
            .map(|g| build_group(g, &failover, &ping))
            .collect::<Result<Vec<_>>>()?;
        let trunks = self
            .trunks
            .iter()
            .map(build_trunk)
            .collect::<Result<Vec<_>>>()?;

        Ok(LoadedConfig {
            proxy: self.proxy.clone(),
            circuit_breaker: self.circuit_breaker.to_config()?,
            routing: RoutingConfig::new(groups, failover, trunks)?,
        })
    }
}

/// Read, parse and validate a configuration file.
pub fn load(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    FileConfig::from_path(path)?.build()
}

fn build_group(
    settings: &ServerGroupSettings,
    failover: &FailoverPolicies,
    ping: &HashMap<String, PingPolicy>,
) -> Result<ServerGroup> {
    let transport: Transport = settings.transport.parse()?;
    if settings.failover_policy != trunkline_core::GLOBAL_POLICY
        && !failover.contains(&settings.failover_policy)
    {
        return Err(Error::config(format!(
            "server group '{}' references unknown failover policy '{}'",
            settings.name, settings.failover_policy
        )));
    }

    let mut builder = ServerGroup::builder(settings.name.clone())
        .network(settings.network.clone())
        .lb_type(settings.lb_type)
        .transport(transport)
        .failover_policy(settings.failover_policy.clone());

    if let Some(name) = &settings.ping_policy {
        let policy = ping.get(name).ok_or_else(|| {
            Error::config(format!(
                "server group '{}' references unknown ping policy '{name}'",
                settings.name
            ))
        })?;
        builder = builder.ping_policy(policy.clone());
    }

    match (&settings.dns_host, settings.elements.is_empty()) {
        (Some(_), false) => {
            return Err(Error::config(format!(
                "server group '{}' has both dns_host and static elements",
                settings.name
            )))
        }
        (Some(host), true) => builder = builder.dns(host.clone(), settings.dns_port),
        (None, _) => {}
    }

    for element in &settings.elements {
        if !(0.0..=1.0).contains(&element.q_value) {
            return Err(Error::config(format!(
                "server group '{}': q_value {} of {} is outside [0, 1]",
                settings.name, element.q_value, element.host
            )));
        }
        let element_transport = match &element.transport {
            Some(t) => t.parse()?,
            None => transport,
        };
        builder = builder.element(ServerGroupElement::new(
            element.host.clone(),
            element
                .port
                .unwrap_or_else(|| element_transport.default_port()),
            element_transport,
            element.q_value,
            element.weight,
            settings.name.clone(),
        ));
    }
    Ok(builder.build())
}

fn build_trunk(settings: &TrunkSettings) -> Result<TrunkConfig> {
    if settings.response_timeout_ms == 0 {
        return Err(Error::config(format!(
            "trunk '{}': response_timeout_ms must be positive",
            settings.name
        )));
    }
    let mut server_groups = Vec::with_capacity(settings.egress.len());
    for egress in &settings.egress {
        if !(0.0..=1.0).contains(&egress.priority) {
            return Err(Error::config(format!(
                "trunk '{}': priority {} of {} is outside [0, 1]",
                settings.name, egress.priority, egress.server_group
            )));
        }
        server_groups.push(
            EgressGroupRef::new(egress.server_group.clone()).ranked(egress.priority, egress.weight),
        );
    }

    Ok(TrunkConfig {
        name: settings.name.clone(),
        kind: settings.kind,
        ingress: IngressConfig {
            name: settings
                .ingress
                .clone()
                .unwrap_or_else(|| settings.name.clone()),
            strip_params: settings.strip_params.clone(),
        },
        egress: EgressConfig {
            lb_type: settings.lb_type,
            server_groups,
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            selector: settings.selector.clone(),
        },
    })
}
