//! Command-line and environment configuration.

use crate::error::SetupError;
use clap::{Parser, ValueEnum};
use sensor_bus::transport::DEFAULT_GROUP;
use sensor_bus::{ChannelConfig, ConfigError, DEFAULT_HISTORY_DEPTH, MembershipConfig, PeerId};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

/// Identity used when none is configured.
pub const DEFAULT_NODE_NAME: &str = "nodeX";

/// How long to wait for peers before the first publish (default: 5s).
pub const DEFAULT_DISCOVERY_GRACE: Duration = Duration::from_secs(5);

/// Interval between published readings (default: 2s).
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on one receive wait, and so on shutdown latency (default: 500ms).
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// UDP multicast on the local network
    Udp,
    /// In-process bus shared with simulated peers
    Memory,
}

#[derive(Parser, Debug)]
#[command(name = "sensor-node")]
#[command(about = "Sensor bus node: publishes synthetic readings and logs peers' readings")]
pub struct Args {
    /// Node identity on the bus
    #[arg(long, env = "NODE_NAME", default_value = DEFAULT_NODE_NAME)]
    pub node_name: String,

    /// Directory for the log file (<dir>/<node>.log); logs to stdout if unset
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Transport to join the bus with
    #[arg(long, value_enum, default_value_t = TransportKind::Udp)]
    pub transport: TransportKind,

    /// Multicast group and port (udp transport)
    #[arg(long, default_value_t = DEFAULT_GROUP)]
    pub group: SocketAddrV4,

    /// Simulated peers to run in-process (memory transport)
    #[arg(long, default_value_t = 2)]
    pub peers: usize,

    /// Milliseconds between published readings
    #[arg(long, default_value_t = DEFAULT_PUBLISH_INTERVAL.as_millis() as u64)]
    pub publish_interval_ms: u64,

    /// Milliseconds to wait for a reading before checking for shutdown
    #[arg(long, default_value_t = DEFAULT_POLL_TIMEOUT.as_millis() as u64)]
    pub poll_timeout_ms: u64,

    /// Milliseconds to wait for discovery before publishing
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_GRACE.as_millis() as u64)]
    pub discovery_grace_ms: u64,

    /// Unconsumed readings kept per peer before the oldest is dropped
    #[arg(long, default_value_t = DEFAULT_HISTORY_DEPTH)]
    pub history_depth: usize,

    /// Milliseconds between presence announcements
    #[arg(long, default_value_t = 1_000)]
    pub announce_interval_ms: u64,

    /// Milliseconds of silence before a peer is considered lost
    #[arg(long, default_value_t = 6_000)]
    pub liveness_timeout_ms: u64,

    /// Milliseconds of silence before a peer is forgotten
    #[arg(long, default_value_t = 30_000)]
    pub removal_grace_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    /// Build and validate the node configuration.
    pub fn node_config(&self) -> Result<NodeConfig, SetupError> {
        let config = NodeConfig {
            node_id: self.node_name.parse()?,
            publish_interval: Duration::from_millis(self.publish_interval_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            discovery_grace: Duration::from_millis(self.discovery_grace_ms),
            channel: ChannelConfig {
                history_depth: self.history_depth,
                membership: MembershipConfig {
                    liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
                    removal_grace: Duration::from_millis(self.removal_grace_ms),
                    announce_interval: Duration::from_millis(self.announce_interval_ms),
                },
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Everything a node needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: PeerId,
    pub publish_interval: Duration,
    pub poll_timeout: Duration,
    /// Heuristic wait for peers to become visible; not a completeness guarantee
    pub discovery_grace: Duration,
    pub channel: ChannelConfig,
}

impl NodeConfig {
    /// Defaults matching the reference deployment.
    pub fn new(node_id: PeerId) -> Self {
        Self {
            node_id,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            discovery_grace: DEFAULT_DISCOVERY_GRACE,
            channel: ChannelConfig::default(),
        }
    }

    /// Same timing, different identity (used for simulated peers).
    pub fn for_node(&self, node_id: PeerId) -> Self {
        Self {
            node_id,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_interval.is_zero() {
            return Err(ConfigError::Zero("publish interval"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Zero("poll timeout"));
        }
        self.channel.validate()
    }
}
