use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol;
use crate::error::MulticastError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Group and port shared by publishers and listeners
#[derive(Debug, Clone, Deserialize)]
pub struct MulticastConfig {
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Only consulted by the daemon; a library caller decides by constructing a Publisher
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_interval")]
    pub interval_secs: f64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: f64,
    #[serde(default = "default_reinit_backoff")]
    pub reinit_backoff_secs: f64,
    /// Announcement fields used by the daemon when `message` is empty
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub name: String,
    /// Raw payload, sent verbatim when set
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_recv_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_liveness")]
    pub liveness_secs: f64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: f64,
    /// Keep only services whose type contains this substring (empty keeps all)
    #[serde(default)]
    pub type_filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: f64,
}

fn default_group() -> Ipv4Addr {
    protocol::DEFAULT_MULTICAST_GROUP
}

fn default_port() -> u16 {
    protocol::DEFAULT_PORT
}

fn default_ttl() -> u32 {
    protocol::DEFAULT_TTL
}

fn default_interval() -> f64 {
    protocol::DEFAULT_PUBLISH_INTERVAL_SECS
}

fn default_grace_period() -> f64 {
    protocol::DEFAULT_GRACE_PERIOD_SECS
}

fn default_reinit_backoff() -> f64 {
    protocol::DEFAULT_REINIT_BACKOFF_SECS
}

fn default_service_type() -> String {
    "vault".to_string()
}

fn default_recv_timeout() -> f64 {
    protocol::DEFAULT_RECV_TIMEOUT_SECS
}

fn default_buffer_size() -> usize {
    protocol::DEFAULT_BUFFER_SIZE
}

fn default_liveness() -> f64 {
    protocol::DEFAULT_LIVENESS_SECS
}

fn default_sweep_interval() -> f64 {
    protocol::DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_stop_timeout() -> f64 {
    protocol::DEFAULT_STOP_TIMEOUT_SECS
}

/// Seconds from the config file as a Duration; out-of-range values are caught by `validate`
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
        }
    }
}

impl MulticastConfig {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self { group, port }
    }

    /// Destination every announcement is sent to
    pub fn target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !self.group.is_multicast() {
            return Err(MulticastError::InvalidConfig(format!(
                "{} is not an IPv4 multicast address",
                self.group
            )));
        }
        if self.port == 0 {
            return Err(MulticastError::InvalidConfig("port must not be 0".into()));
        }
        Ok(())
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_ttl(),
            interval_secs: default_interval(),
            grace_period_secs: default_grace_period(),
            reinit_backoff_secs: default_reinit_backoff(),
            service_type: default_service_type(),
            addr: String::new(),
            name: String::new(),
            message: String::new(),
        }
    }
}

impl PublisherConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        secs(self.grace_period_secs)
    }

    pub fn reinit_backoff(&self) -> Duration {
        secs(self.reinit_backoff_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.ttl > 255 {
            return Err(MulticastError::InvalidConfig(format!("ttl {} exceeds 255", self.ttl)));
        }
        positive("publisher.interval_secs", self.interval_secs)?;
        non_negative("publisher.grace_period_secs", self.grace_period_secs)?;
        non_negative("publisher.reinit_backoff_secs", self.reinit_backoff_secs)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_recv_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ListenerConfig {
    pub fn recv_timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.buffer_size == 0 {
            return Err(MulticastError::InvalidConfig("listener.buffer_size must not be 0".into()));
        }
        positive("listener.timeout_secs", self.timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_secs: default_liveness(),
            sweep_interval_secs: default_sweep_interval(),
            type_filter: String::new(),
        }
    }
}

impl RegistryConfig {
    pub fn liveness_window(&self) -> Duration {
        secs(self.liveness_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        positive("registry.liveness_secs", self.liveness_secs)?;
        positive("registry.sweep_interval_secs", self.sweep_interval_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn stop_timeout(&self) -> Duration {
        secs(self.stop_timeout_secs)
    }
}

fn positive(field: &str, value: f64) -> crate::Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MulticastError::InvalidConfig(format!("{} must be > 0, got {}", field, value)))
    }
}

fn non_negative(field: &str, value: f64) -> crate::Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(MulticastError::InvalidConfig(format!("{} must be >= 0, got {}", field, value)))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.multicast.validate()?;
        self.publisher.validate()?;
        self.listener.validate()?;
        self.registry.validate()?;
        positive("shutdown.stop_timeout_secs", self.shutdown.stop_timeout_secs)
    }
}
