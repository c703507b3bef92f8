//! Configuration data types.

use crate::store::{
    CheckOptions, CheckType, DEFAULT_BUFFER_SIZE, DEFAULT_ZONE_SIZE, ExpectedResponse,
    RequestTemplate,
};
use crate::upstream::Module;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Check settings inherited by every upstream
    #[serde(default)]
    pub healthcheck: HealthCheckDefaults,

    /// Upstream groups to check
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Number of worker threads sharing the check load
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Scheduler tick
    #[serde(default = "default_tick", with = "crate::config::duration::humantime_serde")]
    pub tick: Duration,

    /// Byte budget of each upstream's shared zone
    #[serde(default = "default_zone_size")]
    pub zone_size: usize,

    /// Directory for persisted check options
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            workers: default_workers(),
            tick: default_tick(),
            zone_size: default_zone_size(),
            persist_dir: None,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Check settings shared by all upstreams.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckDefaults {
    /// Probe type; upstreams without one are not checked
    #[serde(default, rename = "type")]
    pub check_type: Option<CheckType>,

    /// Consecutive failures before marking a peer down
    #[serde(default = "default_fall")]
    pub fall: u32,

    /// Consecutive successes before marking a peer up
    #[serde(default = "default_rise")]
    pub rise: u32,

    /// Timeout of each probe phase
    #[serde(default = "default_timeout", with = "crate::config::duration::humantime_serde")]
    pub timeout: Duration,

    /// Minimum time between probes of one peer
    #[serde(default = "default_interval", with = "crate::config::duration::humantime_serde")]
    pub interval: Duration,

    /// Probes per connection
    #[serde(default = "default_keepalive")]
    pub keepalive: u32,

    /// Probe response buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Host prefixes disabled in every upstream
    #[serde(default)]
    pub disabled_hosts: Vec<String>,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            check_type: None,
            fall: default_fall(),
            rise: default_rise(),
            timeout: default_timeout(),
            interval: default_interval(),
            keepalive: default_keepalive(),
            buffer_size: default_buffer_size(),
            disabled_hosts: Vec::new(),
        }
    }
}

/// Upstream group configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Unique name within the module
    pub name: String,

    /// Routing domain: http or stream
    #[serde(default)]
    pub module: Module,

    /// Peers of the group
    pub servers: Vec<ServerConfig>,

    /// Check settings for this group
    #[serde(default)]
    pub check: UpstreamCheckConfig,
}

/// Individual server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address as `host:port`; host names may resolve to several peers
    pub server: String,

    /// Whether the server is a backup peer
    #[serde(default)]
    pub backup: bool,
}

/// Per-upstream check configuration. Unset fields inherit the defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamCheckConfig {
    #[serde(default, rename = "type")]
    pub check_type: Option<CheckType>,

    #[serde(default)]
    pub fall: Option<u32>,

    #[serde(default)]
    pub rise: Option<u32>,

    #[serde(default, with = "crate::config::duration::option_humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default, with = "crate::config::duration::option_humantime_serde")]
    pub interval: Option<Duration>,

    #[serde(default)]
    pub keepalive: Option<u32>,

    /// Probe this port instead of the peer's own
    #[serde(default)]
    pub port: Option<u16>,

    /// Let real traffic stand in for probes of healthy peers
    #[serde(default)]
    pub passive: bool,

    /// Stop probing without changing peer state
    #[serde(default)]
    pub off: bool,

    /// Force every peer down
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub request: RequestTemplate,

    #[serde(default)]
    pub expected: ExpectedResponse,

    #[serde(default)]
    pub disabled_hosts: Vec<String>,

    /// Host prefixes never probed
    #[serde(default)]
    pub excluded_hosts: Vec<String>,

    /// Keep admin changes across restarts
    #[serde(default)]
    pub persistent: bool,
}

impl UpstreamConfig {
    /// Effective check options of this upstream.
    pub fn check_options(&self, defaults: &HealthCheckDefaults) -> CheckOptions {
        let check = &self.check;
        CheckOptions {
            check_type: check.check_type.or(defaults.check_type),
            fall: check.fall.unwrap_or(defaults.fall),
            rise: check.rise.unwrap_or(defaults.rise),
            timeout: check.timeout.unwrap_or(defaults.timeout),
            interval: check.interval.unwrap_or(defaults.interval),
            keepalive: check.keepalive.unwrap_or(defaults.keepalive),
            request: check.request.clone(),
            expected: check.expected.clone(),
            port: check.port,
            passive: check.passive,
            off: check.off,
            disabled: check.disabled,
            global_disabled_hosts: defaults.disabled_hosts.clone(),
            disabled_hosts: check.disabled_hosts.clone(),
            excluded_hosts: check.excluded_hosts.clone(),
            buffer_size: defaults.buffer_size,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_workers() -> usize {
    1
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_zone_size() -> usize {
    DEFAULT_ZONE_SIZE
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_fall() -> u32 {
    1
}

fn default_rise() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_keepalive() -> u32 {
    1
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
