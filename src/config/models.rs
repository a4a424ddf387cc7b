// src/config/models.rs
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no backend servers configured")]
    EmptyPool,

    #[error("health check interval must be positive")]
    ZeroInterval,

    #[error("health check timeout must be positive")]
    ZeroTimeout,

    #[error("backend {0} must use http or https")]
    UnsupportedScheme(Url),

    #[error("backend {0} has no host")]
    MissingHost(Url),

    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(alias = "health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    pub servers: Vec<Url>,

    #[serde(alias = "listen_port")]
    pub listen_port: String,

    #[serde(default, alias = "health_check")]
    pub health_check: HealthCheckConfig,

    #[serde(default, alias = "load_balancer")]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::EmptyPool);
        }
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.health_check.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        for server in &self.servers {
            if !matches!(server.scheme(), "http" | "https") {
                return Err(ConfigError::UnsupportedScheme(server.clone()));
            }
            if server.host_str().is_none() {
                return Err(ConfigError::MissingHost(server.clone()));
            }
        }

        self.listen_addr()?;
        Ok(())
    }

    /// Resolves `listen_port` into a bind address. Accepts `":8080"`,
    /// `"8080"` and `"host:port"`.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = self.listen_port.trim();
        let candidate = if let Some(port) = raw.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else if raw.parse::<u16>().is_ok() {
            format!("0.0.0.0:{raw}")
        } else {
            raw.to_string()
        };

        candidate
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidListenAddr(self.listen_port.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Health path relative to the backend URL. The backend URL itself is
    /// requested when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: default_check_timeout(),
            path: None,
        }
    }
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    #[serde(default, alias = "no_healthy_backend")]
    pub no_healthy_backend: NoHealthyPolicy,
}

/// What selection does when every backend is flagged unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoHealthyPolicy {
    /// Fail the request with 503.
    #[default]
    Reject,
    /// Pick the least-loaded backend ignoring health.
    LeastLoaded,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}
