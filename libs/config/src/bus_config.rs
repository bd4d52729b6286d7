//! Node Configuration Module
//!
//! Loads a node's settings from a TOML file, an optional environment
//! overlay file and `SBUS_`-prefixed environment variables, in that order of
//! increasing precedence. Every field has a default, so an empty file is a
//! valid single-node configuration.
//!
//! Environment variables use `__` between section and field:
//! `SBUS_NODE__MACHINE_ID=3`, `SBUS_TRANSPORT__IO_DEADLINE_MS=5000`.

use crate::defaults;
use anyhow::{bail, ensure, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Complete configuration for one bus node
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub node: NodeSettings,
    pub serial: SerialSettings,
    pub cluster: ClusterSettings,
    pub transport: TransportSettings,
    pub logging: LoggingConfig,
}

/// Identity, listening socket and membership
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeSettings {
    pub machine_id: u32,
    pub group: String,
    pub listen_addr: String,
    /// Address announced to peers; defaults to the bound listen address
    pub advertise_addr: Option<String>,
    /// Peers known without a directory service
    pub static_peers: Vec<StaticPeer>,
    pub lock_attempts: u32,
    pub lock_base_delay_ms: u64,
    pub dial_attempts: u32,
    pub dial_base_delay_ms: u64,
    pub keep_alive_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticPeer {
    pub machine_id: u32,
    pub group: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialSettings {
    pub ring_capacity: usize,
    pub tick_us: u64,
    pub unsubscribe_timeout_ticks: u32,
    pub control_queue_depth: usize,
    pub shutdown_settle_ticks: u32,
    pub release_grace_secs: u64,
    pub bag_slot_depth: usize,
}

/// What a report about a departed identity means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathPolicySetting {
    #[default]
    Sticky,
    Revivable,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub max_identities: usize,
    pub death_policy: DeathPolicySetting,
    pub gate_failure_threshold: u32,
    pub gate_recovery_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub io_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub send_queue_depth: usize,
    pub max_frame_len: usize,
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `bus=debug,network=info`
    pub level: String,
    pub format: LogFormat,
    /// Prefer `RUST_LOG` over `level` when it is set
    pub respect_rust_log: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            machine_id: 0,
            group: defaults::node::GROUP.to_string(),
            listen_addr: defaults::node::LISTEN_ADDR.to_string(),
            advertise_addr: None,
            static_peers: Vec::new(),
            lock_attempts: defaults::node::LOCK_ATTEMPTS,
            lock_base_delay_ms: defaults::node::LOCK_BASE_DELAY_MS,
            dial_attempts: defaults::node::DIAL_ATTEMPTS,
            dial_base_delay_ms: defaults::node::DIAL_BASE_DELAY_MS,
            keep_alive_interval_ms: defaults::node::KEEP_ALIVE_INTERVAL_MS,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            ring_capacity: defaults::serial::RING_CAPACITY,
            tick_us: defaults::serial::TICK_US,
            unsubscribe_timeout_ticks: defaults::serial::UNSUBSCRIBE_TIMEOUT_TICKS,
            control_queue_depth: defaults::serial::CONTROL_QUEUE_DEPTH,
            shutdown_settle_ticks: defaults::serial::SHUTDOWN_SETTLE_TICKS,
            release_grace_secs: defaults::serial::RELEASE_GRACE_SECS,
            bag_slot_depth: defaults::serial::BAG_SLOT_DEPTH,
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            max_identities: defaults::cluster::MAX_IDENTITIES,
            death_policy: DeathPolicySetting::Sticky,
            gate_failure_threshold: defaults::cluster::GATE_FAILURE_THRESHOLD,
            gate_recovery_ms: defaults::cluster::GATE_RECOVERY_MS,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: defaults::transport::CONNECT_TIMEOUT_MS,
            io_deadline_ms: defaults::transport::IO_DEADLINE_MS,
            heartbeat_interval_ms: defaults::transport::HEARTBEAT_INTERVAL_MS,
            send_queue_depth: defaults::transport::SEND_QUEUE_DEPTH,
            max_frame_len: defaults::transport::MAX_FRAME_LEN,
            read_buffer_size: defaults::transport::READ_BUFFER_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::logging::LEVEL.to_string(),
            format: LogFormat::Pretty,
            respect_rust_log: true,
        }
    }
}

impl SerialSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.tick_us)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.release_grace_secs)
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_deadline(&self) -> Duration {
        Duration::from_millis(self.io_deadline_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl BusConfig {
    /// Load configuration from files with environment overrides
    ///
    /// With no `base_path`, `config/bus.toml` is used if it exists. An
    /// `environment` adds `config/environments/<environment>.toml` on top.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match base_path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::from(Path::new("config/bus.toml")).required(false)),
        };

        if let Some(env) = environment {
            let env_file = PathBuf::from("config/environments").join(format!("{}.toml", env));
            if env_file.exists() {
                info!(path = ?env_file, "Loading environment config");
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!(path = ?env_file, "Environment config not found");
            }
        }

        // Override with environment variables (SBUS_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("SBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let loaded: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        debug!(
            machine_id = loaded.node.machine_id,
            group = %loaded.node.group,
            "configuration loaded"
        );
        Ok(loaded)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("Failed to parse TOML configuration")
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    /// Expand `$VAR` and `${VAR}` in address fields
    pub fn expand_env_vars(&mut self) -> Result<()> {
        self.node.listen_addr = shellexpand::env(&self.node.listen_addr)
            .context("Failed to expand listen address")?
            .to_string();
        if let Some(advertise) = &self.node.advertise_addr {
            let expanded =
                shellexpand::env(advertise).context("Failed to expand advertise address")?;
            self.node.advertise_addr = Some(expanded.to_string());
        }
        for peer in &mut self.node.static_peers {
            peer.address = shellexpand::env(&peer.address)
                .with_context(|| format!("Failed to expand address of peer {}", peer.machine_id))?
                .to_string();
        }
        Ok(())
    }

    /// Check cross-field constraints the types cannot express
    pub fn validate(&self) -> Result<()> {
        let serial = &self.serial;
        ensure!(
            serial.ring_capacity.is_power_of_two() && serial.ring_capacity >= 8,
            "serial.ring_capacity {} must be a power of two >= 8",
            serial.ring_capacity
        );
        ensure!(serial.tick_us > 0, "serial.tick_us must be positive");
        ensure!(
            serial.control_queue_depth > 0,
            "serial.control_queue_depth must be positive"
        );
        ensure!(
            serial.bag_slot_depth > 0,
            "serial.bag_slot_depth must be positive"
        );

        let transport = &self.transport;
        ensure!(
            transport.heartbeat_interval_ms < transport.io_deadline_ms,
            "transport.heartbeat_interval_ms {} must be below io_deadline_ms {}",
            transport.heartbeat_interval_ms,
            transport.io_deadline_ms
        );
        ensure!(
            transport.send_queue_depth > 0,
            "transport.send_queue_depth must be positive"
        );
        ensure!(
            transport.max_frame_len >= 8,
            "transport.max_frame_len {} cannot hold a frame header",
            transport.max_frame_len
        );

        let max_identities = self.cluster.max_identities;
        ensure!(max_identities > 0, "cluster.max_identities must be positive");
        ensure!(
            (self.node.machine_id as usize) < max_identities,
            "node.machine_id {} is outside 0..{}",
            self.node.machine_id,
            max_identities
        );
        ensure!(!self.node.group.is_empty(), "node.group must not be empty");
        parse_addr("node.listen_addr", &self.node.listen_addr)?;
        if let Some(advertise) = &self.node.advertise_addr {
            parse_addr("node.advertise_addr", advertise)?;
        }

        let mut seen = HashSet::new();
        for peer in &self.node.static_peers {
            if !seen.insert(peer.machine_id) {
                bail!("static peer {} listed twice", peer.machine_id);
            }
            ensure!(
                (peer.machine_id as usize) < max_identities,
                "static peer {} is outside 0..{}",
                peer.machine_id,
                max_identities
            );
            parse_addr("node.static_peers.address", &peer.address)?;
        }
        Ok(())
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("{field} '{value}' is not a socket address"))
}

/// Load, expand and validate in one step
pub fn load_config(base_path: Option<&Path>, environment: Option<&str>) -> Result<BusConfig> {
    let mut config = BusConfig::load(base_path, environment)?;
    config.expand_env_vars()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_base_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("bus.toml");

        let config_content = r#"
[node]
machine_id = 4
group = "matchers"
listen_addr = "127.0.0.1:7404"

[[node.static_peers]]
machine_id = 1
group = "gateways"
address = "127.0.0.1:7401"

[serial]
ring_capacity = 4096

[cluster]
death_policy = "revivable"

[logging]
format = "json"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = load_config(Some(&config_path), None).unwrap();

        assert_eq!(config.node.machine_id, 4);
        assert_eq!(config.node.group, "matchers");
        assert_eq!(config.node.static_peers.len(), 1);
        assert_eq!(config.serial.ring_capacity, 4096);
        assert_eq!(config.serial.tick_us, defaults::serial::TICK_US);
        assert_eq!(config.cluster.death_policy, DeathPolicySetting::Revivable);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.transport.io_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_environment_variables_override_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("bus.toml");
        fs::write(&config_path, "[node]\ndial_attempts = 2\n").unwrap();

        std::env::set_var("SBUS_NODE__DIAL_ATTEMPTS", "9");
        std::env::set_var("SBUS_TRANSPORT__SEND_QUEUE_DEPTH", "77");
        let config = BusConfig::load(Some(&config_path), None);
        std::env::remove_var("SBUS_NODE__DIAL_ATTEMPTS");
        std::env::remove_var("SBUS_TRANSPORT__SEND_QUEUE_DEPTH");

        let config = config.unwrap();
        assert_eq!(config.node.dial_attempts, 9);
        assert_eq!(config.transport.send_queue_depth, 77);
    }

    #[test]
    fn test_missing_required_file_fails() {
        let dir = tempdir().unwrap();
        assert!(BusConfig::load(Some(&dir.path().join("absent.toml")), None).is_err());
    }

    #[test]
    fn test_empty_toml_is_valid_default() {
        let config = BusConfig::from_toml_str("").unwrap();
        assert_eq!(config, BusConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_rendered_defaults_parse_back() {
        let rendered = BusConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("[transport]"));
        assert_eq!(
            BusConfig::from_toml_str(&rendered).unwrap(),
            BusConfig::default()
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BusConfig::default();
        config.serial.ring_capacity = 1000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("power of two"), "{err}");

        let mut config = BusConfig::default();
        config.node.machine_id = 5000;
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.transport.heartbeat_interval_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.serial.bag_slot_depth = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("bag_slot_depth"), "{err}");

        let mut config = BusConfig::default();
        config.node.listen_addr = "not-an-address".into();
        let err = format!("{:#}", config.validate().unwrap_err());
        assert!(err.contains("node.listen_addr"), "{err}");
    }

    #[test]
    fn test_duplicate_static_peers_rejected() {
        let config = BusConfig::from_toml_str(
            r#"
[[node.static_peers]]
machine_id = 2
group = "a"
address = "127.0.0.1:1"

[[node.static_peers]]
machine_id = 2
group = "b"
address = "127.0.0.1:2"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("listed twice"), "{err}");
    }

    #[test]
    fn test_addresses_expand_environment() {
        std::env::set_var("SBUS_TEST_EXPAND_PORT", "7999");
        let mut config = BusConfig::default();
        config.node.listen_addr = "127.0.0.1:${SBUS_TEST_EXPAND_PORT}".into();
        config.expand_env_vars().unwrap();
        std::env::remove_var("SBUS_TEST_EXPAND_PORT");

        assert_eq!(config.node.listen_addr, "127.0.0.1:7999");
    }
}
