//! sensor-bus: decentralized peer discovery and telemetry exchange.
//!
//! This crate provides:
//! - Validated node identity and the sensor reading payload
//! - A membership table with implicit discovery and liveness tracking
//! - A bounded, drop-oldest pub/sub channel with per-producer ordering
//! - A `Transport` abstraction with in-memory and UDP multicast implementations

pub mod buffer;
pub mod channel;
pub mod membership;
pub mod message;
pub mod peer_id;
pub mod reading;
pub mod transport;

pub use buffer::ReceiveBuffer;
pub use channel::{Ack, Channel, ChannelConfig, ChannelError, ChannelStats, DEFAULT_HISTORY_DEPTH};
pub use membership::{
    ConfigError, Member, Membership, MembershipConfig, MembershipEvent, PeerState, SeenOutcome,
};
pub use message::BusMessage;
pub use peer_id::{InstanceId, PeerId, PeerIdError};
pub use reading::{Reading, ReadingError};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportError, UdpTransport};
