//! Runtime node configuration
//!
//! [`BusConfig`] holds plain serializable settings; [`NodeConfig`] is the
//! same information mapped onto the structs each layer consumes.

use crate::error::{BusError, BusResult};
use bus_config::{BusConfig, DeathPolicySetting};
use network::discovery::{CircuitBreakerConfig, PeerInfo};
use network::{ClusterConfig, DeathPolicy, MachineId, PeerState, RetryPolicy, TransportConfig};
use serial::EngineConfig;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub machine_id: MachineId,
    pub group: String,
    pub listen_addr: SocketAddr,
    /// Address registered in the peer directory; the bound address if unset
    pub advertise_addr: Option<SocketAddr>,
    /// Seeded into the directory before the node registers itself
    pub static_peers: Vec<PeerInfo>,
    pub engine: EngineConfig,
    pub transport: TransportConfig,
    pub cluster: ClusterConfig,
    pub gate: CircuitBreakerConfig,
    pub lock_retry: RetryPolicy,
    pub dial_retry: RetryPolicy,
    pub keep_alive_interval: Duration,
}

impl NodeConfig {
    /// Loopback node on an ephemeral port with small buffers and fast retries
    pub fn local(machine_id: MachineId, group: impl Into<String>) -> Self {
        Self {
            machine_id,
            group: group.into(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_addr: None,
            static_peers: Vec::new(),
            engine: EngineConfig {
                ring_capacity: 1 << 16,
                tick: Duration::from_millis(1),
                unsubscribe_timeout_ticks: 1_000,
                shutdown_settle_ticks: 5,
                release_grace: Duration::from_millis(50),
                ..Default::default()
            },
            transport: TransportConfig::default(),
            cluster: ClusterConfig {
                local_id: machine_id,
                max_identities: 64,
                death_policy: DeathPolicy::Sticky,
            },
            gate: CircuitBreakerConfig::fast_recovery(),
            lock_retry: RetryPolicy::new(5, 10),
            dial_retry: RetryPolicy::new(5, 20),
            keep_alive_interval: Duration::from_secs(1),
        }
    }

    pub fn from_settings(settings: &BusConfig) -> BusResult<Self> {
        let node = &settings.node;
        let listen_addr = parse_addr("node.listen_addr", &node.listen_addr)?;
        let advertise_addr = node
            .advertise_addr
            .as_deref()
            .map(|addr| parse_addr("node.advertise_addr", addr))
            .transpose()?;

        let static_peers = node
            .static_peers
            .iter()
            .map(|peer| {
                Ok(PeerInfo {
                    machine_id: peer.machine_id,
                    group: peer.group.clone(),
                    address: parse_addr("node.static_peers.address", &peer.address)?,
                    state: PeerState::Work,
                })
            })
            .collect::<BusResult<Vec<_>>>()?;

        let serial = &settings.serial;
        let engine = EngineConfig {
            ring_capacity: serial.ring_capacity,
            tick: serial.tick(),
            unsubscribe_timeout_ticks: serial.unsubscribe_timeout_ticks,
            control_queue_depth: serial.control_queue_depth,
            shutdown_settle_ticks: serial.shutdown_settle_ticks,
            release_grace: serial.release_grace(),
            bag_slot_depth: serial.bag_slot_depth,
        };

        let t = &settings.transport;
        let transport = TransportConfig {
            connect_timeout: t.connect_timeout(),
            io_deadline: t.io_deadline(),
            heartbeat_interval: t.heartbeat_interval(),
            send_queue_depth: t.send_queue_depth,
            max_frame_len: t.max_frame_len,
            read_buffer_size: t.read_buffer_size,
        };
        transport.validate()?;

        let cluster = &settings.cluster;
        if node.machine_id as usize >= cluster.max_identities {
            return Err(BusError::configuration(format!(
                "machine id {} does not fit a routing table of {} identities",
                node.machine_id, cluster.max_identities
            )));
        }

        Ok(Self {
            machine_id: node.machine_id,
            group: node.group.clone(),
            listen_addr,
            advertise_addr,
            static_peers,
            engine,
            transport,
            cluster: ClusterConfig {
                local_id: node.machine_id,
                max_identities: cluster.max_identities,
                death_policy: match cluster.death_policy {
                    DeathPolicySetting::Sticky => DeathPolicy::Sticky,
                    DeathPolicySetting::Revivable => DeathPolicy::Revivable,
                },
            },
            gate: CircuitBreakerConfig {
                failure_threshold: cluster.gate_failure_threshold,
                recovery_timeout: Duration::from_millis(cluster.gate_recovery_ms),
                ..Default::default()
            },
            lock_retry: RetryPolicy::new(node.lock_attempts, node.lock_base_delay_ms),
            dial_retry: RetryPolicy::new(node.dial_attempts, node.dial_base_delay_ms),
            keep_alive_interval: Duration::from_millis(node.keep_alive_interval_ms),
        })
    }
}

fn parse_addr(field: &str, value: &str) -> BusResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| {
            BusError::configuration(format!("{field} '{value}' is not a socket address: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_config::StaticPeer;

    #[test]
    fn test_settings_map_onto_runtime_structs() {
        let mut settings = BusConfig::default();
        settings.node.machine_id = 3;
        settings.node.group = "pricing".into();
        settings.node.listen_addr = "127.0.0.1:7403".into();
        settings.node.static_peers.push(StaticPeer {
            machine_id: 4,
            group: "pricing".into(),
            address: "127.0.0.1:7404".into(),
        });
        settings.cluster.death_policy = DeathPolicySetting::Revivable;
        settings.serial.tick_us = 250;

        let config = NodeConfig::from_settings(&settings).unwrap();
        assert_eq!(config.listen_addr.port(), 7403);
        assert_eq!(config.cluster.local_id, 3);
        assert_eq!(config.cluster.death_policy, DeathPolicy::Revivable);
        assert_eq!(config.engine.tick, Duration::from_micros(250));
        assert_eq!(config.static_peers[0].address.port(), 7404);
        assert_eq!(config.static_peers[0].state, PeerState::Work);
    }

    #[test]
    fn test_rejects_unparseable_address() {
        let mut settings = BusConfig::default();
        settings.node.listen_addr = "not-an-address".into();
        let err = NodeConfig::from_settings(&settings).unwrap_err();
        assert!(err.to_string().contains("node.listen_addr"));
    }

    #[test]
    fn test_rejects_identity_outside_table() {
        let mut settings = BusConfig::default();
        settings.cluster.max_identities = 4;
        settings.node.machine_id = 4;
        assert!(matches!(
            NodeConfig::from_settings(&settings),
            Err(BusError::Configuration { .. })
        ));
    }
}
