//! Bus wire messages.
//!
//! Every frame on the transport is one `BusMessage` encoded as UTF-8 JSON.
//! Every variant names its sender and the sender's instance, so receivers can
//! treat any frame as a liveness signal.

use crate::peer_id::{InstanceId, PeerId};
use crate::reading::Reading;
use serde::{Deserialize, Serialize};

/// Largest frame accepted from the transport (fits in one UDP datagram).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusMessage {
    /// Presence announcement / heartbeat.
    Announce { from: PeerId, instance: InstanceId },

    /// A published reading, addressed to the peers the publisher saw alive.
    #[serde(rename_all = "camelCase")]
    Data {
        from: PeerId,
        instance: InstanceId,
        /// Per-producer sequence number, starting at 1
        seq: u64,
        /// Peers this reading is for; anyone else drops it
        recipients: Vec<PeerId>,
        reading: Reading,
    },

    /// Graceful departure.
    Leave { from: PeerId, instance: InstanceId },
}

impl BusMessage {
    pub fn announce(from: PeerId, instance: InstanceId) -> Self {
        Self::Announce { from, instance }
    }

    pub fn leave(from: PeerId, instance: InstanceId) -> Self {
        Self::Leave { from, instance }
    }

    /// Sender of this frame.
    pub fn from(&self) -> &PeerId {
        match self {
            Self::Announce { from, .. } | Self::Data { from, .. } | Self::Leave { from, .. } => {
                from
            }
        }
    }

    /// Sender's process instance.
    pub fn instance(&self) -> InstanceId {
        match self {
            Self::Announce { instance, .. }
            | Self::Data { instance, .. }
            | Self::Leave { instance, .. } => *instance,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::Data { .. } => "data",
            Self::Leave { .. } => "leave",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns None for anything that is not a well-formed bus message,
    /// including oversized frames.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FRAME_SIZE || !is_likely_bus_message(data) {
            return None;
        }
        serde_json::from_slice(data).ok()
    }
}

/// Quick check if data looks like a JSON object (starts with '{').
pub fn is_likely_bus_message(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}
